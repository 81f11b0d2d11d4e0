//! The asynchronous TLS handshake driver.
//!
//! [`Handshake`] drives a client or server handshake over an established TCP
//! stream, entirely inside readiness callbacks: each poll performs exactly
//! the handshake steps the socket currently allows and suspends on the next
//! `WouldBlock`. Dropping the future cancels the handshake and closes the
//! stream it owns.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::net::TcpStream;
use tokio_rustls::{Accept, Connect};

use crate::conn::Connection;

pub(crate) enum Handshake {
    /// Client side: the first poll initiates by writing the ClientHello.
    Client(Connect<TcpStream>),
    /// Server side: progress is made as the peer's records arrive.
    Server(Accept<TcpStream>),
}

impl Future for Handshake {
    type Output = io::Result<Connection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Handshake::Client(connect) => match Pin::new(connect).poll(cx) {
                Poll::Ready(Ok(stream)) => {
                    log::trace!("client TLS handshake complete");
                    Poll::Ready(Ok(Connection::from_tls_client(stream)))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Err(normalize_error(e))),
                Poll::Pending => Poll::Pending,
            },
            Handshake::Server(accept) => match Pin::new(accept).poll(cx) {
                Poll::Ready(Ok(stream)) => {
                    log::trace!("server TLS handshake complete");
                    Poll::Ready(Ok(Connection::from_tls_server(stream)))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Err(normalize_error(e))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// A peer that disappears mid-handshake surfaces as an EOF or an empty error;
/// both are reported as a connection reset with a stable message.
fn normalize_error(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof || e.to_string().is_empty() {
        io::Error::new(
            io::ErrorKind::ConnectionReset,
            "Connection lost during TLS handshake",
        )
    } else {
        e
    }
}
