use tokio::net::UnixStream;

use super::{Connect, Connecting};
use crate::conn::Connection;
use crate::error::Error;
use crate::target::{Scheme, Target};

/// Connector for `unix://` targets.
///
/// The socket path is validated before connecting so failures carry the
/// specific OS code: `ENOENT` when the path does not exist, `ENOTSOCK` when
/// it names something other than a socket, `EINVAL` for a malformed target.
#[derive(Clone, Debug, Default)]
pub struct UnixConnector {
    _priv: (),
}

impl UnixConnector {
    /// Constructs a new `UnixConnector`.
    pub fn new() -> UnixConnector {
        UnixConnector { _priv: () }
    }
}

impl Connect for UnixConnector {
    fn connect(&self, target: &str) -> Connecting {
        let target = target.to_owned();
        Box::pin(async move {
            let parsed = Target::parse(&target, Scheme::Unix)?;
            if parsed.scheme() != Scheme::Unix {
                return Err(Error::invalid_uri(format!(
                    "invalid URI \"{}\": Unix connector requires the unix:// scheme",
                    target
                )));
            }
            let path = parsed.unix_path().ok_or_else(|| {
                Error::invalid_uri(format!("invalid URI \"{}\": no socket path given", target))
            })?;
            let uri = parsed.to_string();

            match std::fs::metadata(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::connect(
                        &uri,
                        std::io::Error::from_raw_os_error(libc::ENOENT),
                    ));
                }
                Err(e) => return Err(Error::connect(&uri, e)),
                Ok(metadata) => {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        return Err(Error::connect(
                            &uri,
                            std::io::Error::from_raw_os_error(libc::ENOTSOCK),
                        ));
                    }
                }
            }

            log::debug!("connecting to {}", uri);
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| Error::connect(&uri, e))?;

            Ok(Connection::from_unix(stream, path))
        })
    }
}
