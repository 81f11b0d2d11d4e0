//! Server-side listeners.
//!
//! A [`Listener`] yields accepted [`Connection`]s. Accept failures are
//! yielded as `Err` items and never terminate the listener; a closed
//! listener yields `None`. [`pause`](Listener::pause) stops accepting
//! without touching established connections, which propagates backpressure
//! to the kernel accept queue.
//!
//! Leaf listeners bind TCP sockets ([`TcpServer`]), Unix domain sockets
//! ([`UnixServer`]) or adopt an inherited descriptor ([`FdServer`]);
//! decorators add TLS ([`TlsServer`]) and connection limiting
//! ([`LimitingServer`]). [`bind`] is the facade dispatching a target URI to
//! the right composition.

#[cfg(unix)]
pub(crate) mod fd;
pub(crate) mod limit;
pub(crate) mod tcp;
pub(crate) mod tls;
#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub use self::fd::FdServer;
pub use self::limit::LimitingServer;
pub use self::tcp::{TcpServer, TcpServerOptions};
pub use self::tls::TlsServer;
#[cfg(unix)]
pub use self::unix::UnixServer;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::tls::TlsOptions;

/// The seam every server implements.
pub trait Listener: Send {
    /// Polls for the next accepted connection.
    ///
    /// `Some(Err(_))` is a per-connection failure (the accept call failed, a
    /// TLS handshake was refused, the connection limit rejected a client);
    /// the listener stays usable. `None` means the listener was closed.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>>;

    /// The canonical local address (`tcp://…`, `tls://…`, `unix://…`),
    /// absent once closed.
    fn local_addr(&self) -> Option<String>;

    /// Stops accepting new connections until [`resume`](Listener::resume).
    /// Established connections are unaffected.
    fn pause(&mut self);

    /// Resumes accepting after a [`pause`](Listener::pause).
    fn resume(&mut self);

    /// Closes the listener. Idempotent and permanent; pending accepts yield
    /// `None` and the address becomes absent.
    fn close(&mut self);
}

impl std::fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Listener")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl<L: Listener + ?Sized> Listener for Box<L> {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>> {
        (**self).poll_accept(cx)
    }

    fn local_addr(&self) -> Option<String> {
        (**self).local_addr()
    }

    fn pause(&mut self) {
        (**self).pause()
    }

    fn resume(&mut self) {
        (**self).resume()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Extension methods for [`Listener`].
pub trait ListenerExt: Listener {
    /// Waits for the next connection. Resolves to `None` once closed.
    fn accept(&mut self) -> Accept<'_, Self> {
        Accept { listener: self }
    }

    /// Turns the listener into a [`Stream`](futures_core::Stream) of
    /// accepted connections.
    fn incoming(self) -> Incoming<Self>
    where
        Self: Sized,
    {
        Incoming { listener: self }
    }
}

impl<L: Listener + ?Sized> ListenerExt for L {}

/// Future returned by [`ListenerExt::accept`].
#[must_use = "futures do nothing unless polled"]
pub struct Accept<'a, L: ?Sized> {
    listener: &'a mut L,
}

impl<L: Listener + ?Sized> Future for Accept<'_, L> {
    type Output = Option<Result<Connection>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.listener.poll_accept(cx)
    }
}

/// Stream returned by [`ListenerExt::incoming`].
#[must_use = "streams do nothing unless polled"]
pub struct Incoming<L> {
    listener: L,
}

impl<L> Incoming<L> {
    /// Returns the wrapped listener.
    pub fn into_inner(self) -> L {
        self.listener
    }
}

impl<L: Listener + Unpin> futures_core::Stream for Incoming<L> {
    type Item = Result<Connection>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.listener.poll_accept(cx)
    }
}

/// A `ServerBuilder` creates listeners from target URIs with per-scheme
/// options.
#[derive(Default)]
#[must_use]
pub struct ServerBuilder {
    tcp: TcpServerOptions,
    tls: Option<TlsOptions>,
}

impl ServerBuilder {
    /// A builder with default options.
    pub fn new() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Socket options for accepted TCP connections (also used by `tls://`).
    pub fn tcp_options(mut self, options: TcpServerOptions) -> Self {
        self.tcp = options;
        self
    }

    /// TLS context options; required for `tls://` targets.
    pub fn tls_options(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }

    /// Binds a listener for the given target.
    ///
    /// Accepted forms: `tcp://ip:port`, `tls://ip:port`, `unix://path`,
    /// `fd/<N>` and a bare port number, which binds `127.0.0.1:<port>`.
    /// Must be called within a tokio runtime.
    pub fn bind(&self, target: &str) -> Result<Box<dyn Listener>> {
        // A pure numeric target is a loopback port.
        let owned;
        let target = if !target.is_empty() && target.bytes().all(|b| b.is_ascii_digit()) {
            owned = format!("tcp://127.0.0.1:{}", target);
            &owned
        } else {
            target
        };

        #[cfg(unix)]
        if let Some(fd) = target.strip_prefix("fd/") {
            let fd: std::os::unix::io::RawFd = fd.parse().map_err(|_| {
                Error::invalid_uri(format!("invalid URI \"{}\": malformed fd number", target))
            })?;
            return Ok(Box::new(FdServer::new(fd)?));
        }

        let scheme = match target.find("://") {
            Some(idx) => &target[..idx],
            None => "tcp",
        };
        match scheme {
            "tcp" => Ok(Box::new(TcpServer::bind_with(target, self.tcp.clone())?)),
            "tls" => {
                let options = self.tls.clone().ok_or_else(|| {
                    Error::invalid_uri(
                        "a tls:// server requires TLS options with a local certificate",
                    )
                })?;
                let plain = format!("tcp{}", &target["tls".len()..]);
                let inner = TcpServer::bind_with(&plain, self.tcp.clone())?;
                Ok(Box::new(TlsServer::new(inner, options)?))
            }
            #[cfg(unix)]
            "unix" => Ok(Box::new(UnixServer::bind(target)?)),
            other => Err(Error::invalid_uri(format!(
                "no server available for scheme \"{}\"",
                other
            ))),
        }
    }
}

/// Binds a listener for the given target with default options. See
/// [`ServerBuilder::bind`].
pub fn bind(target: &str) -> Result<Box<dyn Listener>> {
    ServerBuilder::new().bind(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn numeric_target_binds_loopback() {
        // Port 0 would be ambiguous here; bind an explicit throwaway port by
        // asking the kernel first.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = bind(&port.to_string()).unwrap();
        assert_eq!(
            server.local_addr(),
            Some(format!("tcp://127.0.0.1:{}", port))
        );
    }

    #[tokio::test]
    async fn tls_requires_options() {
        let err = bind("tls://127.0.0.1:0").unwrap_err();
        assert!(err.is_invalid_uri());
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let err = bind("http://127.0.0.1:0").unwrap_err();
        assert!(err.is_invalid_uri());
    }
}
