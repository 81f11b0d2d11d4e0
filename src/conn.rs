//! Established connections.
//!
//! A [`Connection`] exclusively owns one OS stream socket: plaintext TCP, a
//! Unix domain socket, or a TLS-upgraded TCP stream. It implements
//! [`AsyncRead`] and [`AsyncWrite`]; the event surface of the source model
//! maps onto the pull-based traits (`data` = reads, `end` = `Ok(0)`, `drain`
//! = write readiness, and graceful `end` = [`poll_shutdown`]
//! (AsyncWrite::poll_shutdown), which flushes pending writes before closing
//! the write half).

use std::fmt;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::target::format_addr;

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// A bidirectional byte stream produced by a connector or a server.
///
/// The connection owns the underlying socket; dropping or [`close`]
/// (Connection::close)-ing it releases the descriptor. Address accessors
/// return canonical URI strings (`tcp://host:port`, `tcp://[v6]:port`,
/// `unix://path`, `tls://…` after a successful TLS upgrade) and go absent
/// once the connection is closed.
pub struct Connection {
    stream: Option<Stream>,
    local: Option<Box<str>>,
    peer: Option<Box<str>>,
    writable: bool,
    hostname: Option<Box<str>>,
    guard: Option<Box<dyn std::any::Any + Send>>,
}

impl Connection {
    pub(crate) fn from_tcp(stream: TcpStream, hostname: Option<String>) -> Connection {
        let local = stream.local_addr().ok().map(|a| format_addr("tcp", a).into());
        let peer = stream.peer_addr().ok().map(|a| format_addr("tcp", a).into());
        Connection {
            stream: Some(Stream::Tcp(stream)),
            local,
            peer,
            writable: true,
            hostname: hostname.map(Into::into),
            guard: None,
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: UnixStream, peer_path: &str) -> Connection {
        let local = stream
            .local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.to_string_lossy().into_owned()))
            .map(|p| format!("unix://{}", p))
            .unwrap_or_else(|| "unix://".to_owned());
        Connection {
            stream: Some(Stream::Unix(stream)),
            local: Some(local.into()),
            peer: Some(format!("unix://{}", peer_path).into()),
            writable: true,
            hostname: None,
            guard: None,
        }
    }

    pub(crate) fn from_tls_client(
        stream: tokio_rustls::client::TlsStream<TcpStream>,
    ) -> Connection {
        let tcp = stream.get_ref().0;
        let local = tcp.local_addr().ok().map(|a| format_addr("tls", a).into());
        let peer = tcp.peer_addr().ok().map(|a| format_addr("tls", a).into());
        Connection {
            stream: Some(Stream::TlsClient(Box::new(stream))),
            local,
            peer,
            writable: true,
            hostname: None,
            guard: None,
        }
    }

    pub(crate) fn from_tls_server(
        stream: tokio_rustls::server::TlsStream<TcpStream>,
    ) -> Connection {
        let tcp = stream.get_ref().0;
        let local = tcp.local_addr().ok().map(|a| format_addr("tls", a).into());
        let peer = tcp.peer_addr().ok().map(|a| format_addr("tls", a).into());
        Connection {
            stream: Some(Stream::TlsServer(Box::new(stream))),
            local,
            peer,
            writable: true,
            hostname: None,
            guard: None,
        }
    }

    /// Takes the plaintext TCP stream back out for a TLS upgrade.
    pub(crate) fn into_tcp(mut self) -> Result<(TcpStream, Option<String>)> {
        let hostname = self.hostname.take().map(|h| h.into());
        match self.stream.take() {
            Some(Stream::Tcp(stream)) => Ok((stream, hostname)),
            _ => Err(Error::invalid_uri(
                "TLS upgrade requires a plaintext TCP connection",
            )),
        }
    }

    /// Whether the read half is open.
    pub fn is_readable(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the write half is open.
    pub fn is_writable(&self) -> bool {
        self.stream.is_some() && self.writable
    }

    /// Whether the stream has been TLS-upgraded.
    pub fn is_tls(&self) -> bool {
        matches!(
            self.stream,
            Some(Stream::TlsClient(_)) | Some(Stream::TlsServer(_))
        )
    }

    /// The canonical local address, absent once closed.
    pub fn local_addr(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// The canonical remote address, absent once closed.
    pub fn peer_addr(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// The hostname hint carried over from a `?hostname=` query parameter,
    /// used as the SNI / peer verification name by a TLS upgrade.
    pub(crate) fn sni_hint(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Attaches an opaque guard released on close or drop. The limiting
    /// server uses this to tie a connection slot to the connection lifetime.
    pub(crate) fn attach_guard(&mut self, guard: Box<dyn std::any::Any + Send>) {
        self.guard = Some(guard);
    }

    /// Closes the connection immediately, releasing the socket. Idempotent;
    /// buffered but unsent data is discarded (use [`AsyncWriteExt::shutdown`]
    /// (tokio::io::AsyncWriteExt::shutdown) first for a flushing close).
    pub fn close(&mut self) {
        self.guard = None;
        self.stream = None;
        self.local = None;
        self.peer = None;
        self.writable = false;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("tls", &self.is_tls())
            .finish()
    }
}

macro_rules! with_stream {
    ($self:ident, $cx:ident, |$s:ident| $e:expr, $closed:expr) => {
        match $self.stream {
            Some(Stream::Tcp(ref mut $s)) => $e,
            #[cfg(unix)]
            Some(Stream::Unix(ref mut $s)) => $e,
            Some(Stream::TlsClient(ref mut $s)) => $e,
            Some(Stream::TlsServer(ref mut $s)) => $e,
            None => $closed,
        }
    };
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        with_stream!(
            self,
            cx,
            |s| Pin::new(s).poll_read(cx, buf),
            // Closed: behave like a cleanly ended stream.
            Poll::Ready(Ok(()))
        )
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.writable {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        with_stream!(
            self,
            cx,
            |s| Pin::new(s).poll_write(cx, buf),
            Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        )
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        if !self.writable {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        with_stream!(
            self,
            cx,
            |s| Pin::new(s).poll_write_vectored(cx, bufs),
            Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        )
    }

    fn is_write_vectored(&self) -> bool {
        match self.stream {
            Some(Stream::Tcp(ref s)) => s.is_write_vectored(),
            #[cfg(unix)]
            Some(Stream::Unix(ref s)) => s.is_write_vectored(),
            Some(Stream::TlsClient(ref s)) => s.is_write_vectored(),
            Some(Stream::TlsServer(ref s)) => s.is_write_vectored(),
            None => false,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_stream!(
            self,
            cx,
            |s| Pin::new(s).poll_flush(cx),
            Poll::Ready(Ok(()))
        )
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = with_stream!(
            self,
            cx,
            |s| Pin::new(s).poll_shutdown(cx),
            Poll::Ready(Ok(()))
        );
        if let Poll::Ready(Ok(())) = result {
            self.writable = false;
        }
        result
    }
}
