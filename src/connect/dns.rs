use super::{Connect, Connecting};
use crate::dns::{DynResolver, GaiResolver, IntoResolve, Name};
use crate::error::Error;
use crate::target::{Scheme, Target};

/// Decorator that resolves hostname targets before delegating.
///
/// Literal-IP targets are delegated untouched. For hostnames, the first
/// resolved address is substituted into the target (IPv6 bracketed) and the
/// original hostname rides along as a `?hostname=` query parameter so that a
/// downstream TLS layer can use it for SNI and peer verification.
///
/// This decorator picks one address; [`HappyEyeballsConnector`]
/// (super::HappyEyeballsConnector) is the dual-stack racing alternative.
pub struct DnsConnector<C> {
    inner: C,
    resolver: DynResolver,
}

impl<C> DnsConnector<C> {
    /// Wraps `inner`, resolving through the system resolver.
    pub fn new(inner: C) -> DnsConnector<C> {
        DnsConnector::with_resolver(inner, DynResolver::new(GaiResolver::new().into_resolve()))
    }

    pub(crate) fn with_resolver(inner: C, resolver: DynResolver) -> DnsConnector<C> {
        DnsConnector { inner, resolver }
    }

    /// Wraps `inner` with a custom resolver.
    pub fn with_resolve(inner: C, resolver: impl IntoResolve) -> DnsConnector<C> {
        DnsConnector::with_resolver(inner, DynResolver::new(resolver.into_resolve()))
    }
}

impl<C> Connect for DnsConnector<C>
where
    C: Connect + Clone + 'static,
{
    fn connect(&self, target: &str) -> Connecting {
        let inner = self.inner.clone();
        let resolver = self.resolver.clone();
        let target = target.to_owned();
        Box::pin(async move {
            let parsed = Target::parse(&target, Scheme::Tcp)?;
            if parsed.is_literal_ip() {
                // Nothing to resolve: delegate the caller's URI verbatim.
                return inner.connect(&target).await;
            }

            let host = parsed.host_str();
            log::trace!("resolving {}", host);
            let addrs = resolver
                .resolve(Name::from(host.as_str()))
                .await
                .map_err(|e| Error::dns(&target, e))?;
            let ip = addrs.into_iter().next().ok_or_else(|| {
                Error::dns(&target, format!("no addresses for host \"{}\"", host))
            })?;

            inner.connect(&parsed.with_ip(ip).to_string()).await
        })
    }
}
