use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, RawFd};
use std::task::{Context, Poll, Waker};

use tokio::net::{TcpListener, UnixListener};

use super::Listener;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::target::format_addr;

/// A server adopting an inherited, already-listening file descriptor, e.g.
/// one passed down by a supervising process or socket activation.
///
/// The descriptor is verified to be a listening TCP or Unix stream socket
/// (`SO_TYPE`, `SO_ACCEPTCONN`) and not a connected endpoint. On success the
/// server takes ownership of the descriptor; on a validation error the
/// descriptor is left untouched.
#[derive(Debug)]
pub struct FdServer {
    listener: Option<FdListener>,
    local: Option<String>,
    paused: bool,
    waker: Option<Waker>,
}

#[derive(Debug)]
enum FdListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl FdServer {
    /// Adopts the descriptor. Must be called within a tokio runtime.
    pub fn new(fd: RawFd) -> Result<FdServer> {
        let uri = format!("fd/{}", fd);

        let sock_type = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TYPE)
            .map_err(|e| Error::bind(&uri, e))?;
        if sock_type != libc::SOCK_STREAM {
            return Err(Error::invalid_uri(format!(
                "invalid URI \"{}\": descriptor is not a stream socket",
                uri
            )));
        }
        let accepting = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ACCEPTCONN)
            .map_err(|e| Error::bind(&uri, e))?;
        if accepting == 0 {
            return Err(Error::invalid_uri(format!(
                "invalid URI \"{}\": descriptor is not a listening socket",
                uri
            )));
        }

        let family = socket_family(fd).map_err(|e| Error::bind(&uri, e))?;
        let (listener, local) = match family {
            libc::AF_INET | libc::AF_INET6 => {
                // Safety: validated above; ownership of the fd transfers to
                // the listener on success.
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| Error::bind(&uri, e))?;
                let local = std_listener.local_addr().ok().map(|a| format_addr("tcp", a));
                let listener =
                    TcpListener::from_std(std_listener).map_err(|e| Error::bind(&uri, e))?;
                (FdListener::Tcp(listener), local)
            }
            libc::AF_UNIX => {
                // Safety: as above.
                let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| Error::bind(&uri, e))?;
                let local = std_listener
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_pathname().map(|p| p.to_string_lossy().into_owned()))
                    .map(|p| format!("unix://{}", p));
                let listener =
                    UnixListener::from_std(std_listener).map_err(|e| Error::bind(&uri, e))?;
                (FdListener::Unix(listener), local)
            }
            _ => {
                return Err(Error::invalid_uri(format!(
                    "invalid URI \"{}\": unsupported socket family {}",
                    uri, family
                )))
            }
        };

        log::debug!(
            "adopted listening descriptor {} ({})",
            fd,
            local.as_deref().unwrap_or("unnamed")
        );
        Ok(FdServer {
            listener: Some(listener),
            local,
            paused: false,
            waker: None,
        })
    }
}

fn getsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        Ok(value)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn socket_family(fd: RawFd) -> io::Result<libc::c_int> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc == 0 {
        Ok(libc::c_int::from(storage.ss_family))
    } else {
        Err(io::Error::last_os_error())
    }
}

impl Listener for FdServer {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Connection>>> {
        let Some(listener) = self.listener.as_ref() else {
            return Poll::Ready(None);
        };
        if self.paused {
            self.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        match listener {
            FdListener::Tcp(tcp) => match tcp.poll_accept(cx) {
                Poll::Ready(Ok((stream, _))) => {
                    Poll::Ready(Some(Ok(Connection::from_tcp(stream, None))))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Some(Err(Error::accept(e)))),
                Poll::Pending => Poll::Pending,
            },
            FdListener::Unix(unix) => match unix.poll_accept(cx) {
                Poll::Ready(Ok((stream, _))) => {
                    let path = self
                        .local
                        .as_deref()
                        .and_then(|l| l.strip_prefix("unix://"))
                        .unwrap_or("")
                        .to_owned();
                    Poll::Ready(Some(Ok(Connection::from_unix(stream, &path))))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Some(Err(Error::accept(e)))),
                Poll::Pending => Poll::Pending,
            },
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
