use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::TcpKeepalive;
use tokio::net::TcpSocket;

use super::{Connect, Connecting};
use crate::conn::Connection;
use crate::error::Error;
use crate::target::{Scheme, Target};

/// Socket options applied to outgoing TCP connections.
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    nodelay: bool,
    keepalive: Option<Duration>,
    send_buffer_size: Option<usize>,
    recv_buffer_size: Option<usize>,
    local_address_ipv4: Option<Ipv4Addr>,
    local_address_ipv6: Option<Ipv6Addr>,
    reuse_address: bool,
}

impl TcpOptions {
    /// Default options: kernel defaults for everything.
    pub fn new() -> TcpOptions {
        TcpOptions::default()
    }

    /// Set `TCP_NODELAY` on connected sockets. Default is `false`.
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Set `SO_KEEPALIVE` with the supplied idle duration.
    pub fn keepalive(mut self, time: Option<Duration>) -> Self {
        self.keepalive = time;
        self
    }

    /// Sets the value of the `SO_SNDBUF` option on the socket.
    pub fn send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Sets the value of the `SO_RCVBUF` option on the socket.
    pub fn recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Bind sockets to this local IPv4 address before connecting.
    pub fn local_address_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.local_address_ipv4 = Some(addr);
        self
    }

    /// Bind sockets to this local IPv6 address before connecting.
    pub fn local_address_ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.local_address_ipv6 = Some(addr);
        self
    }

    /// Set `SO_REUSEADDR`. Default is `false`.
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }
}

/// The plaintext TCP leaf connector.
///
/// Accepts only `tcp://` targets whose host is a literal IP address with a
/// port; resolving hostnames is the job of the DNS and Happy Eyeballs
/// decorators. A `?hostname=` query parameter rides along on the returned
/// [`Connection`] as the SNI hint for a later TLS upgrade.
#[derive(Clone, Default)]
pub struct TcpConnector {
    config: Arc<TcpOptions>,
}

impl TcpConnector {
    /// Creates a connector with the given socket options.
    pub fn new(options: TcpOptions) -> TcpConnector {
        TcpConnector {
            config: Arc::new(options),
        }
    }
}

impl Connect for TcpConnector {
    fn connect(&self, target: &str) -> Connecting {
        let config = self.config.clone();
        let target = target.to_owned();
        Box::pin(async move {
            let parsed = Target::parse(&target, Scheme::Tcp)?;
            if parsed.scheme() != Scheme::Tcp {
                return Err(Error::invalid_uri(format!(
                    "invalid URI \"{}\": TCP connector requires the tcp:// scheme",
                    target
                )));
            }
            let addr = parsed.socket_addr().ok_or_else(|| {
                Error::invalid_uri(format!(
                    "invalid URI \"{}\": TCP connector requires a literal IP address and port",
                    target
                ))
            })?;

            let uri = parsed.to_string();
            log::debug!("connecting to {}", addr);

            let socket = open_socket(&addr, &config).map_err(|e| Error::connect(&uri, e))?;
            let stream = socket
                .connect(addr)
                .await
                .map_err(|e| Error::connect(&uri, e))?;
            log::debug!("connected to {}", addr);

            if let Err(e) = stream.set_nodelay(config.nodelay) {
                log::warn!("tcp set_nodelay error: {}", e);
            }

            Ok(Connection::from_tcp(stream, parsed.hostname_hint()))
        })
    }
}

fn open_socket(addr: &SocketAddr, config: &TcpOptions) -> io::Result<TcpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // When constructing a Tokio `TcpSocket` from a raw fd/socket, the user is
    // responsible for ensuring O_NONBLOCK is set.
    socket.set_nonblocking(true)?;

    if let Some(time) = config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(time);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            log::warn!("tcp set_keepalive error: {}", e);
        }
    }

    bind_local_address(
        &socket,
        addr,
        &config.local_address_ipv4,
        &config.local_address_ipv6,
    )?;

    #[cfg(unix)]
    let socket = unsafe {
        // Safety: `from_raw_fd` is only safe to call if ownership of the raw
        // file descriptor is transferred. Since we call `into_raw_fd` on the
        // socket2 socket, it gives up ownership of the fd and will not close
        // it, so this is safe.
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        TcpSocket::from_raw_fd(socket.into_raw_fd())
    };
    #[cfg(windows)]
    let socket = unsafe {
        // Safety: `from_raw_socket` is only safe to call if ownership of the
        // raw Windows SOCKET is transferred; `into_raw_socket` gives it up.
        use std::os::windows::io::{FromRawSocket, IntoRawSocket};
        TcpSocket::from_raw_socket(socket.into_raw_socket())
    };

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            log::warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            log::warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            log::warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    Ok(socket)
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    local_addr_ipv4: &Option<Ipv4Addr>,
    local_addr_ipv6: &Option<Ipv6Addr>,
) -> io::Result<()> {
    match (*dst_addr, local_addr_ipv4, local_addr_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        _ => {
            if cfg!(windows) {
                // Windows requires a socket be bound before calling connect.
                let any: SocketAddr = match *dst_addr {
                    SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
                    SocketAddr::V6(_) => ([0, 0, 0, 0, 0, 0, 0, 0], 0).into(),
                };
                socket.bind(&any.into())?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_literal_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(TcpOptions::new().nodelay(true));
        let conn = connector
            .connect(&format!("tcp://{}", addr))
            .await
            .unwrap();
        assert_eq!(conn.peer_addr(), Some(format!("tcp://{}", addr).as_str()));
    }

    #[tokio::test]
    async fn rejects_hostnames_and_missing_ports() {
        let connector = TcpConnector::new(TcpOptions::new());

        let err = connector.connect("tcp://example.com:80").await.unwrap_err();
        assert!(err.is_invalid_uri());

        let err = connector.connect("tcp://127.0.0.1").await.unwrap_err();
        assert!(err.is_invalid_uri());

        let err = connector.connect("tls://127.0.0.1:80").await.unwrap_err();
        assert!(err.is_invalid_uri());
    }

    #[tokio::test]
    async fn reports_os_error_on_refused_connect() {
        // Bind a port, then drop the listener so the connect is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new(TcpOptions::new());
        let err = connector
            .connect(&format!("tcp://{}", addr))
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert!(err.raw_os_error().is_some());
        assert!(err
            .to_string()
            .starts_with(&format!("Connection to tcp://{} failed", addr)));
    }

    #[tokio::test]
    async fn carries_hostname_hint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(TcpOptions::new());
        let conn = connector
            .connect(&format!("tcp://{}?hostname=example.com", addr))
            .await
            .unwrap();
        assert_eq!(conn.sni_hint(), Some("example.com"));
    }
}
