use std::task::{Context, Poll, Waker};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpListener;

use super::Listener;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::target::{format_addr, Scheme, Target};

/// Options for accepted TCP connections and the listening socket.
#[derive(Debug, Clone)]
pub struct TcpServerOptions {
    nodelay: bool,
    keepalive: Option<Duration>,
    backlog: i32,
}

impl Default for TcpServerOptions {
    fn default() -> Self {
        TcpServerOptions {
            nodelay: false,
            keepalive: None,
            backlog: 1024,
        }
    }
}

impl TcpServerOptions {
    /// Default options: kernel defaults, backlog 1024.
    pub fn new() -> TcpServerOptions {
        TcpServerOptions::default()
    }

    /// Set `TCP_NODELAY` on accepted connections. Default is `false`.
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Set `SO_KEEPALIVE` on accepted connections with the supplied idle
    /// duration.
    pub fn keepalive(mut self, time: Option<Duration>) -> Self {
        self.keepalive = time;
        self
    }

    /// The listen backlog. Default is 1024.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }
}

/// A plaintext TCP server.
///
/// Binds and listens at construction; accepted sockets are emitted through
/// [`poll_accept`](Listener::poll_accept). Binding `host:0` picks an
/// ephemeral port, reported by [`local_addr`](Listener::local_addr).
#[derive(Debug)]
pub struct TcpServer {
    listener: Option<TcpListener>,
    local: Option<String>,
    options: TcpServerOptions,
    paused: bool,
    waker: Option<Waker>,
}

impl TcpServer {
    /// Binds to a `tcp://ip:port` target with default options.
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(target: &str) -> Result<TcpServer> {
        TcpServer::bind_with(target, TcpServerOptions::default())
    }

    /// Binds with explicit options.
    pub fn bind_with(target: &str, options: TcpServerOptions) -> Result<TcpServer> {
        use socket2::{Domain, Protocol, Socket, Type};

        let parsed = Target::parse(target, Scheme::Tcp)?;
        if parsed.scheme() != Scheme::Tcp {
            return Err(Error::invalid_uri(format!(
                "invalid URI \"{}\": TCP server requires the tcp:// scheme",
                target
            )));
        }
        let addr = parsed.socket_addr().ok_or_else(|| {
            Error::invalid_uri(format!(
                "invalid URI \"{}\": TCP server requires a literal IP address and port",
                target
            ))
        })?;
        let uri = parsed.to_string();

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::bind(&uri, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::bind(&uri, e))?;
        if let Err(e) = socket.set_reuse_address(true) {
            log::warn!("tcp set_reuse_address error: {}", e);
        }
        socket.bind(&addr.into()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::address_in_use(&uri)
            } else {
                Error::bind(&uri, e)
            }
        })?;
        socket
            .listen(options.backlog)
            .map_err(|e| Error::bind(&uri, e))?;

        let listener =
            TcpListener::from_std(socket.into()).map_err(|e| Error::bind(&uri, e))?;
        let local = listener
            .local_addr()
            .map(|a| format_addr("tcp", a))
            .map_err(|e| Error::bind(&uri, e))?;
        log::debug!("listening on {}", local);

        Ok(TcpServer {
            listener: Some(listener),
            local: Some(local),
            options,
            paused: false,
            waker: None,
        })
    }
}

impl Listener for TcpServer {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>> {
        let Some(listener) = self.listener.as_ref() else {
            return Poll::Ready(None);
        };
        if self.paused {
            self.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        match listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, addr))) => {
                log::trace!("accepted connection from {}", addr);
                if let Err(e) = stream.set_nodelay(self.options.nodelay) {
                    log::warn!("tcp set_nodelay error: {}", e);
                }
                if let Some(time) = self.options.keepalive {
                    let keepalive = TcpKeepalive::new().with_time(time);
                    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                        log::warn!("tcp set_keepalive error: {}", e);
                    }
                }
                Poll::Ready(Some(Ok(Connection::from_tcp(stream, None))))
            }
            // Accept failures (EMFILE and friends) are per-connection
            // events; the server keeps listening.
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(Error::accept(e)))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> Option<String> {
        self.local.clone()
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            if let Some(waker) = self.waker.take() {
                waker.wake();
            }
        }
    }

    fn close(&mut self) {
        self.listener = None;
        self.local = None;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ListenerExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn reports_actual_port_for_port_zero() {
        let server = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.starts_with("tcp://127.0.0.1:"));
        assert!(!addr.ends_with(":0"));
    }

    #[tokio::test]
    async fn accepts_connections() {
        let mut server = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

        let (client, accepted) = tokio::join!(
            TcpStream::connect(("127.0.0.1", port)),
            server.accept()
        );
        let client = client.unwrap();
        let conn = accepted.unwrap().unwrap();
        assert_eq!(
            conn.peer_addr().unwrap(),
            format!("tcp://{}", client.local_addr().unwrap())
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_permanent() {
        let mut server = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
        server.close();
        assert_eq!(server.local_addr(), None);
        server.close();
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn address_in_use_is_detected() {
        let server = TcpServer::bind("tcp://127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let target = addr.clone();

        let err = TcpServer::bind(&target).unwrap_err();
        assert!(err.is_address_in_use(), "{}", err);
    }

    #[tokio::test]
    async fn rejects_hostnames() {
        let err = TcpServer::bind("tcp://localhost:0").unwrap_err();
        assert!(err.is_invalid_uri());
    }
}
