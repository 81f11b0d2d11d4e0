//! The RFC 8305 Happy Eyeballs connection builder.
//!
//! Dual-stack hosts are connected by racing AAAA and A resolution and then
//! interleaved connection attempts across both families, so that a broken
//! family costs at most a few hundred milliseconds instead of a kernel
//! connect timeout. The algorithm is expressed as an explicit state machine
//! (`Attempting`) rather than chained callbacks: resolved flags, an
//! interleaved address queue, the two RFC timers and the set of in-flight
//! attempts are all plain fields, which keeps ordering and cancellation
//! auditable.

use std::collections::VecDeque;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Sleep;

use super::{probe, Connect, Connecting};
use crate::conn::Connection;
use crate::dns::{DynResolver, Family, GaiResolver, IntoResolve, Name, Resolving};
use crate::error::{strip_hostname_param, Error, Result};
use crate::target::{Scheme, Target};
use crate::util::shuffle;

/// Grace period for the AAAA answer once the A answer is in (RFC 8305 §3).
pub const RESOLUTION_DELAY: Duration = Duration::from_millis(50);

/// Minimum spacing between starting successive connection attempts,
/// regardless of how earlier attempts fare (RFC 8305 §5).
pub const CONNECTION_ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Decorator racing dual-stack resolution and connection attempts per
/// RFC 8305.
///
/// Literal-IP targets are delegated untouched. For hostnames, AAAA and A are
/// resolved concurrently, the addresses are interleaved across families and
/// attempted with [`CONNECTION_ATTEMPT_DELAY`] pacing; the first established
/// connection wins and every other attempt, timer and query is cancelled.
/// Each attempt carries the original hostname as a `?hostname=` hint for
/// downstream TLS.
pub struct HappyEyeballsConnector<C> {
    inner: Arc<C>,
    resolver: DynResolver,
    precheck: bool,
}

impl<C> HappyEyeballsConnector<C> {
    /// Wraps `inner`, resolving through the system resolver.
    pub fn new(inner: C) -> HappyEyeballsConnector<C> {
        HappyEyeballsConnector::with_resolver(
            inner,
            DynResolver::new(GaiResolver::new().into_resolve()),
        )
    }

    /// Wraps `inner` with a custom resolver.
    pub fn with_resolve(inner: C, resolver: impl IntoResolve) -> HappyEyeballsConnector<C> {
        HappyEyeballsConnector::with_resolver(inner, DynResolver::new(resolver.into_resolve()))
    }

    pub(crate) fn with_resolver(inner: C, resolver: DynResolver) -> HappyEyeballsConnector<C> {
        HappyEyeballsConnector {
            inner: Arc::new(inner),
            resolver,
            precheck: false,
        }
    }

    /// Probes IPv6 routability first (cached process-wide for 60 s) and skips
    /// the AAAA query when IPv6 is unroutable. Default is disabled.
    pub fn ipv6_precheck(mut self, enabled: bool) -> Self {
        self.precheck = enabled;
        self
    }
}

impl<C> Connect for HappyEyeballsConnector<C>
where
    C: Connect + 'static,
{
    fn connect(&self, target: &str) -> Connecting {
        let inner = Arc::clone(&self.inner);
        let resolver = self.resolver.clone();
        let precheck = self.precheck;
        let target = target.to_owned();
        Box::pin(async move {
            let parsed = Target::parse(&target, Scheme::Tcp)?;
            if parsed.is_literal_ip() {
                return inner.connect(&target).await;
            }

            let host = parsed.host_str();
            let uri = parsed.to_string();

            let (aaaa, aaaa_resolved) = if precheck && !probe::ipv6_routable() {
                // Known-unroutable IPv6: treat AAAA as resolved-empty and
                // skip the resolution delay entirely.
                log::debug!("happy eyeballs: IPv6 unroutable, querying A only");
                (None, true)
            } else {
                (
                    Some(resolver.resolve_family(Name::from(host.as_str()), Family::V6)),
                    false,
                )
            };
            let a = Some(resolver.resolve_family(Name::from(host.as_str()), Family::V4));

            Attempting {
                target: parsed,
                uri,
                inner,
                aaaa,
                a,
                aaaa_resolved,
                a_resolved: false,
                parked_v4: None,
                resolution_delay: None,
                queue: VecDeque::new(),
                attempt_delay: None,
                attempts: FuturesUnordered::new(),
                ips_count: 0,
                failure_count: 0,
                last_error_v4: None,
                last_error_v6: None,
                last_error_family: None,
            }
            .await
        })
    }
}

type AttemptFuture = Pin<Box<dyn Future<Output = (Family, Result<Connection>)> + Send>>;

/// One in-flight Happy Eyeballs connect. Dropping it cancels everything it
/// owns: both DNS queries, both timers and every attempt (closing the
/// attempts' sockets).
struct Attempting<C> {
    target: Target,
    uri: String,
    inner: Arc<C>,

    aaaa: Option<Resolving>,
    a: Option<Resolving>,
    aaaa_resolved: bool,
    a_resolved: bool,
    /// A records held back until AAAA answers or the resolution delay fires.
    parked_v4: Option<Vec<IpAddr>>,
    resolution_delay: Option<Pin<Box<Sleep>>>,

    queue: VecDeque<IpAddr>,
    /// While armed, no new attempt may start.
    attempt_delay: Option<Pin<Box<Sleep>>>,
    attempts: FuturesUnordered<AttemptFuture>,

    ips_count: usize,
    failure_count: usize,
    last_error_v4: Option<String>,
    last_error_v6: Option<String>,
    last_error_family: Option<Family>,
}

impl<C> Attempting<C>
where
    C: Connect + 'static,
{
    /// Shuffles the incoming batch and merges it into the connect queue,
    /// alternating with the queued addresses and starting with the incoming
    /// batch.
    fn enqueue(&mut self, mut addrs: Vec<IpAddr>, family: Family) {
        if addrs.is_empty() {
            return;
        }
        log::trace!(
            "happy eyeballs: {} {} record(s) for {}",
            addrs.len(),
            family.record_type(),
            self.target.host_str()
        );
        shuffle(&mut addrs);
        self.ips_count += addrs.len();

        let mut incoming = addrs.into_iter();
        let mut queued = std::mem::take(&mut self.queue).into_iter();
        loop {
            match (incoming.next(), queued.next()) {
                (Some(a), Some(b)) => {
                    self.queue.push_back(a);
                    self.queue.push_back(b);
                }
                (Some(a), None) => self.queue.push_back(a),
                (None, Some(b)) => self.queue.push_back(b),
                (None, None) => break,
            }
        }
    }

    fn launch(&mut self, ip: IpAddr) {
        let family = if ip.is_ipv6() { Family::V6 } else { Family::V4 };
        let attempt_uri = self.target.with_ip(ip).to_string();
        log::debug!("happy eyeballs: attempting {}", attempt_uri);
        let inner = Arc::clone(&self.inner);
        self.attempts
            .push(Box::pin(async move { (family, inner.connect(&attempt_uri).await) }));
    }

    fn record_error(&mut self, family: Family, error: String) {
        let error = strip_hostname_param(&error);
        match family {
            Family::V4 => self.last_error_v4 = Some(error),
            Family::V6 => self.last_error_v6 = Some(error),
        }
        self.last_error_family = Some(family);
    }

    fn exhausted(&self) -> bool {
        self.aaaa_resolved
            && self.a_resolved
            && self.parked_v4.is_none()
            && self.queue.is_empty()
            && self.attempts.is_empty()
    }

    fn exhausted_error(&self) -> Error {
        debug_assert_eq!(self.failure_count, self.ips_count);

        let v6 = self.last_error_v6.as_deref().unwrap_or("no addresses");
        let v4 = self.last_error_v4.as_deref().unwrap_or("no addresses");
        let detail = if v6 == v4 {
            format!("{} (IPv6 and IPv4)", v6)
        } else if self.last_error_family == Some(Family::V4) {
            format!("IPv4: {}; IPv6: {}", v4, v6)
        } else {
            format!("IPv6: {}; IPv4: {}", v6, v4)
        };

        if self.ips_count == 0 {
            Error::connect_msg(
                &self.uri,
                format!(
                    "Connection to {} failed during DNS lookup: {}",
                    self.uri, detail
                ),
            )
        } else {
            Error::connect_msg(
                &self.uri,
                format!("Connection to {} failed: {}", self.uri, detail),
            )
        }
    }
}

impl<C> Future for Attempting<C>
where
    C: Connect + 'static,
{
    type Output = Result<Connection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            // Start the next attempt as soon as the pacing window is open.
            // This runs at the top of the loop so a freshly resolved batch
            // launches before the other family's answer is even ingested.
            if this.attempt_delay.is_none() {
                if let Some(ip) = this.queue.pop_front() {
                    this.launch(ip);
                    this.attempt_delay =
                        Some(Box::pin(tokio::time::sleep(CONNECTION_ATTEMPT_DELAY)));
                    continue;
                }
            }

            if let Some(timer) = this.attempt_delay.as_mut() {
                if timer.as_mut().poll(cx).is_ready() {
                    this.attempt_delay = None;
                    continue;
                }
            }

            if let Some(fut) = this.aaaa.as_mut() {
                if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                    this.aaaa = None;
                    this.aaaa_resolved = true;
                    match result {
                        Ok(addrs) => this.enqueue(addrs, Family::V6),
                        Err(e) => this.record_error(Family::V6, e.to_string()),
                    }
                    // A parked A answer is ingested on a later iteration so
                    // the AAAA batch gets to launch the first attempt.
                    continue;
                }
            }

            if let Some(fut) = this.a.as_mut() {
                if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                    this.a = None;
                    this.a_resolved = true;
                    match result {
                        Ok(addrs) if !this.aaaa_resolved => {
                            // RFC 8305 §3: hold the A answer back briefly to
                            // give AAAA a chance to win the queue head.
                            this.parked_v4 = Some(addrs);
                            this.resolution_delay =
                                Some(Box::pin(tokio::time::sleep(RESOLUTION_DELAY)));
                        }
                        Ok(addrs) => this.enqueue(addrs, Family::V4),
                        Err(e) => this.record_error(Family::V4, e.to_string()),
                    }
                    continue;
                }
            }

            if this.parked_v4.is_some() && this.aaaa_resolved {
                // AAAA answered while the A batch was held back.
                this.resolution_delay = None;
                let parked = this.parked_v4.take().unwrap_or_default();
                this.enqueue(parked, Family::V4);
                continue;
            }

            if let Some(delay) = this.resolution_delay.as_mut() {
                if delay.as_mut().poll(cx).is_ready() {
                    this.resolution_delay = None;
                    if let Some(parked) = this.parked_v4.take() {
                        this.enqueue(parked, Family::V4);
                    }
                    continue;
                }
            }

            match this.attempts.poll_next_unpin(cx) {
                Poll::Ready(Some((family, Ok(conn)))) => {
                    log::debug!(
                        "happy eyeballs: {} attempt won for {}",
                        family,
                        this.target.host_str()
                    );
                    // First success wins. Everything else is dropped:
                    // in-flight attempts close their sockets, pending DNS
                    // queries and timers are cancelled.
                    this.attempts = FuturesUnordered::new();
                    this.queue.clear();
                    this.aaaa = None;
                    this.a = None;
                    this.attempt_delay = None;
                    this.resolution_delay = None;
                    this.parked_v4 = None;
                    return Poll::Ready(Ok(conn));
                }
                Poll::Ready(Some((family, Err(e)))) => {
                    log::trace!("happy eyeballs: {} attempt failed: {}", family, e);
                    this.failure_count += 1;
                    this.record_error(family, e.to_string());
                    continue;
                }
                Poll::Ready(None) | Poll::Pending => {}
            }

            // Reject only when both families have answered, the queue is
            // drained and every started attempt has failed.
            if this.exhausted() {
                return Poll::Ready(Err(this.exhausted_error()));
            }

            return Poll::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn attempting() -> Attempting<super::super::TcpConnector> {
        Attempting {
            target: Target::parse("tcp://example.com:80", Scheme::Tcp).unwrap(),
            uri: "tcp://example.com:80".to_owned(),
            inner: Arc::new(super::super::TcpConnector::new(Default::default())),
            aaaa: None,
            a: None,
            aaaa_resolved: true,
            a_resolved: true,
            parked_v4: None,
            resolution_delay: None,
            queue: VecDeque::new(),
            attempt_delay: None,
            attempts: FuturesUnordered::new(),
            ips_count: 0,
            failure_count: 0,
            last_error_v4: None,
            last_error_v6: None,
            last_error_family: None,
        }
    }

    #[test]
    fn interleave_alternates_families() {
        let mut state = attempting();
        let v6: Vec<IpAddr> = vec![IpAddr::V6(Ipv6Addr::LOCALHOST)];
        state.enqueue(v6, Family::V6);
        let v4: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(), "127.0.0.2".parse().unwrap()];
        state.enqueue(v4, Family::V4);

        // Incoming batch first, then alternating with what was queued.
        assert_eq!(state.queue.len(), 3);
        assert!(state.queue[0].is_ipv4());
        assert!(state.queue[1].is_ipv6());
        assert!(state.queue[2].is_ipv4());
        assert_eq!(state.ips_count, 3);
    }

    #[test]
    fn identical_family_errors_reported_once() {
        let mut state = attempting();
        state.ips_count = 2;
        state.failure_count = 2;
        state.record_error(Family::V6, "Connection refused".to_owned());
        state.record_error(Family::V4, "Connection refused".to_owned());

        let msg = state.exhausted_error().to_string();
        assert_eq!(
            msg,
            "Connection to tcp://example.com:80 failed: Connection refused (IPv6 and IPv4)"
        );
    }

    #[test]
    fn distinct_errors_cite_both_families() {
        let mut state = attempting();
        state.ips_count = 2;
        state.failure_count = 2;
        state.record_error(Family::V4, "network unreachable".to_owned());
        state.record_error(Family::V6, "Connection refused".to_owned());

        let msg = state.exhausted_error().to_string();
        // The family that failed last leads.
        assert_eq!(
            msg,
            "Connection to tcp://example.com:80 failed: \
             IPv6: Connection refused; IPv4: network unreachable"
        );
    }

    #[test]
    fn dns_exhaustion_message() {
        let mut state = attempting();
        state.record_error(Family::V6, "NXDOMAIN".to_owned());
        state.record_error(Family::V4, "NXDOMAIN".to_owned());

        let msg = state.exhausted_error().to_string();
        assert_eq!(
            msg,
            "Connection to tcp://example.com:80 failed during DNS lookup: NXDOMAIN (IPv6 and IPv4)"
        );
    }

    #[test]
    fn attempt_errors_lose_the_hostname_hint() {
        let mut state = attempting();
        state.ips_count = 1;
        state.failure_count = 1;
        state.record_error(
            Family::V4,
            "Connection to tcp://127.0.0.1:80?hostname=example.com failed: refused".to_owned(),
        );

        let msg = state.exhausted_error().to_string();
        assert!(!msg.contains("hostname="), "{}", msg);
    }
}
