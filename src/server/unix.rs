use std::path::{Path, PathBuf};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::net::UnixListener;

use super::Listener;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::target::{Scheme, Target};

/// A Unix domain socket server.
///
/// Before binding, a live socket already serving the path is detected with a
/// short-timeout probe connect and reported as address-in-use; a stale
/// socket file left behind by a dead process is unlinked. Closing the server
/// unlinks the socket file (errors silenced).
#[derive(Debug)]
pub struct UnixServer {
    listener: Option<UnixListener>,
    path: PathBuf,
    local: Option<String>,
    paused: bool,
    waker: Option<Waker>,
}

impl UnixServer {
    /// Binds to a `unix://path` target.
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(target: &str) -> Result<UnixServer> {
        let parsed = Target::parse(target, Scheme::Unix)?;
        if parsed.scheme() != Scheme::Unix {
            return Err(Error::invalid_uri(format!(
                "invalid URI \"{}\": Unix server requires the unix:// scheme",
                target
            )));
        }
        let path = parsed.unix_path().ok_or_else(|| {
            Error::invalid_uri(format!("invalid URI \"{}\": no socket path given", target))
        })?;
        let uri = parsed.to_string();
        let path = PathBuf::from(path);

        if let Ok(metadata) = std::fs::metadata(&path) {
            use std::os::unix::fs::FileTypeExt;
            if !metadata.file_type().is_socket() {
                return Err(Error::address_in_use(&uri));
            }
            if probe_in_use(&path) {
                return Err(Error::address_in_use(&uri));
            }
            // A leftover socket nobody answers on.
            log::debug!("removing stale socket file {}", path.display());
            let _ = std::fs::remove_file(&path);
        }

        let std_listener =
            std::os::unix::net::UnixListener::bind(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    Error::address_in_use(&uri)
                } else {
                    Error::bind(&uri, e)
                }
            })?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| Error::bind(&uri, e))?;
        let listener = UnixListener::from_std(std_listener).map_err(|e| Error::bind(&uri, e))?;
        log::debug!("listening on {}", uri);

        Ok(UnixServer {
            listener: Some(listener),
            path,
            local: Some(uri),
            paused: false,
            waker: None,
        })
    }
}

/// Whether something is actively accepting on the socket at `path`.
fn probe_in_use(path: &Path) -> bool {
    use socket2::{Domain, SockAddr, Socket, Type};

    let Ok(socket) = Socket::new(Domain::UNIX, Type::STREAM, None) else {
        return false;
    };
    let Ok(addr) = SockAddr::unix(path) else {
        return false;
    };
    socket
        .connect_timeout(&addr, Duration::from_millis(100))
        .is_ok()
}

impl Listener for UnixServer {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>> {
        let Some(listener) = self.listener.as_ref() else {
            return Poll::Ready(None);
        };
        if self.paused {
            self.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        match listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, _addr))) => {
                log::trace!("accepted connection on {}", self.path.display());
                Poll::Ready(Some(Ok(Connection::from_unix(
                    stream,
                    &self.path.to_string_lossy(),
                ))))
            }
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
        if self.listener.take().is_some() {
            // Unlink failures at teardown are not actionable.
            let _ = std::fs::remove_file(&self.path);
        }
        self.local = None;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{Connect, UnixConnector};
    use crate::server::ListenerExt;

    #[tokio::test]
    async fn binds_accepts_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let target = format!("unix://{}", path.display());

        let mut server = UnixServer::bind(&target).unwrap();
        assert_eq!(server.local_addr(), Some(target.clone()));

        let connector = UnixConnector::new();
        let (conn, accepted) = tokio::join!(connector.connect(&target), server.accept());
        conn.unwrap();
        accepted.unwrap().unwrap();

        server.close();
        assert!(!path.exists());
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn live_socket_is_address_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.sock");
        let target = format!("unix://{}", path.display());

        let _server = UnixServer::bind(&target).unwrap();
        let err = UnixServer::bind(&target).unwrap_err();
        assert!(err.is_address_in_use(), "{}", err);
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let target = format!("unix://{}", path.display());

        // Bind and abandon without unlinking.
        {
            let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
            drop(listener);
        }
        assert!(path.exists());

        let server = UnixServer::bind(&target).unwrap();
        assert_eq!(server.local_addr(), Some(target));
    }
}
