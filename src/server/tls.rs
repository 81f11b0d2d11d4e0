use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_rustls::TlsAcceptor;

use super::Listener;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::tls::handshake::Handshake;
use crate::tls::TlsOptions;

type HandshakeFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Connection, (String, io::Error)>> + Send>>;

/// The secure server decorator.
///
/// Every plaintext connection accepted by the wrapped listener goes through
/// a server-side TLS handshake; handshakes run concurrently so a slow or
/// hostile client cannot stall the accept loop. A successful handshake
/// yields the encrypted connection; a failed one yields an `Err` item naming
/// the remote and the plaintext stream is closed. Errors of the wrapped
/// listener are forwarded verbatim.
pub struct TlsServer<L> {
    inner: L,
    acceptor: TlsAcceptor,
    handshakes: FuturesUnordered<HandshakeFuture>,
    closed: bool,
}

impl<L: Listener> TlsServer<L> {
    /// Wraps `inner`, building the TLS server context from `options`
    /// (`local_cert` is required).
    pub fn new(inner: L, options: TlsOptions) -> Result<TlsServer<L>> {
        let config = options.server_config()?;
        Ok(TlsServer {
            inner,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handshakes: FuturesUnordered::new(),
            closed: false,
        })
    }
}

impl<L: Listener> Listener for TlsServer<L> {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>> {
        loop {
            match self.handshakes.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(conn))) => return Poll::Ready(Some(Ok(conn))),
                Poll::Ready(Some(Err((remote, e)))) => {
                    log::debug!("TLS handshake with {} failed: {}", remote, e);
                    return Poll::Ready(Some(Err(Error::encryption_msg(format!(
                        "Connection from {} failed during TLS handshake: {}",
                        remote, e
                    )))));
                }
                Poll::Ready(None) | Poll::Pending => {}
            }

            if self.closed {
                return Poll::Ready(None);
            }

            match self.inner.poll_accept(cx) {
                Poll::Ready(Some(Ok(conn))) => {
                    // The remote address may be unobtainable after a failed
                    // handshake, so it is recorded up front.
                    let remote = conn
                        .peer_addr()
                        .map(str::to_owned)
                        .unwrap_or_else(|| "unknown".to_owned());
                    match conn.into_tcp() {
                        Ok((stream, _)) => {
                            let acceptor = self.acceptor.clone();
                            self.handshakes.push(Box::pin(async move {
                                Handshake::Server(acceptor.accept(stream))
                                    .await
                                    .map_err(|e| (remote, e))
                            }));
                            continue;
                        }
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if self.handshakes.is_empty() {
                        return Poll::Ready(None);
                    }
                    // Drain the handshakes still in flight; their wakers are
                    // registered from the poll above.
                    return Poll::Pending;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn local_addr(&self) -> Option<String> {
        self.inner
            .local_addr()
            .map(|addr| match addr.strip_prefix("tcp://") {
                Some(rest) => format!("tls://{}", rest),
                None => addr,
            })
    }

    fn pause(&mut self) {
        self.inner.pause();
    }

    fn resume(&mut self) {
        self.inner.resume();
    }

    fn close(&mut self) {
        self.closed = true;
        self.inner.close();
        // Dropping pending handshakes closes their plaintext streams.
        self.handshakes = FuturesUnordered::new();
    }
}
