use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use super::Listener;
use crate::conn::Connection;
use crate::error::{Error, Result};

type Acquiring =
    Pin<Box<dyn Future<Output = std::result::Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// Decorator capping the number of concurrently open accepted connections.
///
/// Every accepted connection occupies a slot until it is closed or dropped.
/// With the limit reached:
///
/// * in **reject** mode, further connections are closed immediately and an
///   `Err` item reports the rejection;
/// * in **pause** mode (`pause_on_limit`), the wrapped listener is paused
///   and not polled until a slot frees up, so pressure propagates to the
///   kernel accept queue instead of hand-closing clients.
///
/// Manual [`pause`](Listener::pause)/[`resume`](Listener::resume) and the
/// automatic limit pause are independent; the wrapped listener runs only
/// when neither holds.
pub struct LimitingServer<L> {
    inner: L,
    limit: Option<usize>,
    pause_on_limit: bool,
    semaphore: Option<Arc<Semaphore>>,
    pending_permit: Option<OwnedSemaphorePermit>,
    acquiring: Option<Acquiring>,
    auto_paused: bool,
    manual_paused: bool,
}

impl<L: Listener> LimitingServer<L> {
    /// Wraps `inner`. A `limit` of `None` means unlimited; `pause_on_limit`
    /// selects pause mode over reject mode.
    pub fn new(inner: L, limit: Option<usize>, pause_on_limit: bool) -> LimitingServer<L> {
        LimitingServer {
            inner,
            limit,
            pause_on_limit,
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
            pending_permit: None,
            acquiring: None,
            auto_paused: false,
            manual_paused: false,
        }
    }

    /// The number of tracked open connections. Only meaningful with a limit.
    pub fn connection_count(&self) -> usize {
        match (&self.semaphore, self.limit) {
            (Some(semaphore), Some(limit)) => {
                limit - semaphore.available_permits() - usize::from(self.pending_permit.is_some())
            }
            _ => 0,
        }
    }

    fn poll_reject_mode(
        &mut self,
        cx: &mut Context<'_>,
        semaphore: Arc<Semaphore>,
    ) -> Poll<Option<Result<Connection>>> {
        match self.inner.poll_accept(cx) {
            Poll::Ready(Some(Ok(mut conn))) => match semaphore.try_acquire_owned() {
                Ok(permit) => {
                    conn.attach_guard(Box::new(permit));
                    Poll::Ready(Some(Ok(conn)))
                }
                Err(_) => {
                    let remote = conn
                        .peer_addr()
                        .map(str::to_owned)
                        .unwrap_or_else(|| "unknown".to_owned());
                    log::debug!("rejecting {}: connection limit reached", remote);
                    conn.close();
                    Poll::Ready(Some(Err(Error::connect_msg(
                        &remote,
                        format!(
                            "Connection from {} rejected because server reached connection limit",
                            remote
                        ),
                    ))))
                }
            },
            other => other,
        }
    }

    fn poll_pause_mode(
        &mut self,
        cx: &mut Context<'_>,
        semaphore: Arc<Semaphore>,
    ) -> Poll<Option<Result<Connection>>> {
        // Hold a slot before even polling the upstream listener.
        if self.pending_permit.is_none() {
            if self.acquiring.is_none() {
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => self.pending_permit = Some(permit),
                    Err(_) => {
                        self.acquiring = Some(Box::pin(semaphore.acquire_owned()));
                        if !self.auto_paused {
                            log::debug!("connection limit reached, pausing listener");
                            self.auto_paused = true;
                            self.inner.pause();
                        }
                    }
                }
            }
            if let Some(acquiring) = self.acquiring.as_mut() {
                match acquiring.as_mut().poll(cx) {
                    Poll::Ready(Ok(permit)) => {
                        self.acquiring = None;
                        self.pending_permit = Some(permit);
                        if self.auto_paused {
                            log::debug!("connection slot freed, resuming listener");
                            self.auto_paused = false;
                            if !self.manual_paused {
                                self.inner.resume();
                            }
                        }
                    }
                    // The semaphore is never closed.
                    Poll::Ready(Err(_)) => return Poll::Pending,
                    Poll::Pending => return Poll::Pending,
                }
            }
        }

        match self.inner.poll_accept(cx) {
            Poll::Ready(Some(Ok(mut conn))) => {
                let permit = self
                    .pending_permit
                    .take()
                    .expect("slot acquired before accepting");
                conn.attach_guard(Box::new(permit));
                Poll::Ready(Some(Ok(conn)))
            }
            other => other,
        }
    }
}

impl<L: Listener> Listener for LimitingServer<L> {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>> {
        let Some(semaphore) = self.semaphore.clone() else {
            return self.inner.poll_accept(cx);
        };
        if self.pause_on_limit {
            self.poll_pause_mode(cx, semaphore)
        } else {
            self.poll_reject_mode(cx, semaphore)
        }
    }

    fn local_addr(&self) -> Option<String> {
        self.inner.local_addr()
    }

    fn pause(&mut self) {
        self.manual_paused = true;
        self.inner.pause();
    }

    fn resume(&mut self) {
        self.manual_paused = false;
        if !self.auto_paused {
            self.inner.resume();
        }
    }

    fn close(&mut self) {
        self.pending_permit = None;
        self.acquiring = None;
        self.inner.close();
    }
}
