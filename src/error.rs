use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is `socketry::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while connecting, listening or accepting.
///
/// Note: errors may include the full target URI of the operation. If the
/// target contains sensitive information (e.g. credentials in the userinfo),
/// be sure to remove it ([`without_target`](Error::without_target)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    msg: Option<Box<str>>,
    source: Option<BoxError>,
    target: Option<Box<str>>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                msg: None,
                source: source.map(Into::into),
                target: None,
            }),
        }
    }

    fn message<S: Into<Box<str>>>(mut self, msg: S) -> Error {
        self.inner.msg = Some(msg.into());
        self
    }

    pub(crate) fn invalid_uri<S: Into<Box<str>>>(msg: S) -> Error {
        Error::new(Kind::InvalidUri, None::<Error>).message(msg)
    }

    pub(crate) fn connect<E: Into<BoxError>>(target: &str, e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
            .message(format!("Connection to {} failed", target))
            .with_target(target)
    }

    /// A connect failure with a fully composed message and no separate cause
    /// (used for the Happy Eyeballs composite error and limiter rejections).
    pub(crate) fn connect_msg<S: Into<Box<str>>>(target: &str, msg: S) -> Error {
        Error::new(Kind::Connect, None::<Error>)
            .message(msg)
            .with_target(target)
    }

    pub(crate) fn dns<E: Into<BoxError>>(target: &str, e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
            .message(format!("Connection to {} failed during DNS lookup", target))
            .with_target(target)
    }

    pub(crate) fn timeout(target: &str, seconds: f64) -> Error {
        Error::new(Kind::Timeout, Some(TimedOut))
            .message(format!(
                "Connection to {} timed out after {:.2} seconds",
                target, seconds
            ))
            .with_target(target)
    }

    pub(crate) fn encryption<E: Into<BoxError>>(target: &str, e: E) -> Error {
        Error::new(Kind::Encryption, Some(e))
            .message(format!(
                "Connection to {} failed during TLS handshake",
                target
            ))
            .with_target(target)
    }

    pub(crate) fn encryption_msg<S: Into<Box<str>>>(msg: S) -> Error {
        Error::new(Kind::Encryption, None::<Error>).message(msg)
    }

    pub(crate) fn bind<E: Into<BoxError>>(target: &str, e: E) -> Error {
        Error::new(Kind::Bind, Some(e))
            .message(format!("Failed to listen on {}", target))
            .with_target(target)
    }

    pub(crate) fn address_in_use(target: &str) -> Error {
        Error::new(Kind::AddressInUse, None::<Error>)
            .message(format!("Failed to listen on {}: address already in use", target))
            .with_target(target)
    }

    pub(crate) fn accept<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Accept, Some(e)).message("Unable to accept new connection")
    }

    pub(crate) fn with_target(mut self, target: &str) -> Self {
        self.inner.target = Some(target.into());
        self
    }
}

impl Error {
    /// Returns the target URI related to this error, if any.
    pub fn target(&self) -> Option<&str> {
        self.inner.target.as_deref()
    }

    /// Strip the related target from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_target(mut self) -> Self {
        self.inner.target = None;
        self
    }

    /// Returns true if the error came from parsing or validating a URI.
    pub fn is_invalid_uri(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidUri)
    }

    /// Returns true if the error is a failure to establish a connection,
    /// including DNS failures and exhausted Happy Eyeballs attempts.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error came from a TLS handshake.
    pub fn is_encryption(&self) -> bool {
        matches!(self.inner.kind, Kind::Encryption)
    }

    /// Returns true if the error came from binding a server socket.
    pub fn is_bind(&self) -> bool {
        matches!(self.inner.kind, Kind::Bind | Kind::AddressInUse)
    }

    /// Returns true if a server address was already in use.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self.inner.kind, Kind::AddressInUse)
    }

    /// Returns true if the error came from accepting a connection. Accept
    /// errors are per-connection events and never terminate a server.
    pub fn is_accept(&self) -> bool {
        matches!(self.inner.kind, Kind::Accept)
    }

    /// Returns the raw OS error code of the underlying I/O failure, walking
    /// the source chain.
    pub fn raw_os_error(&self) -> Option<i32> {
        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if let Some(code) = io.raw_os_error() {
                    return Some(code);
                }
            }
            source = err.source();
        }
        None
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("socketry::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref target) = self.inner.target {
            builder.field("target", target);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.msg {
            Some(ref msg) => f.write_str(msg)?,
            None => f.write_str(match self.inner.kind {
                Kind::InvalidUri => "invalid URI",
                Kind::Connect => "connection failed",
                Kind::Bind => "bind failed",
                Kind::AddressInUse => "address already in use",
                Kind::Accept => "accept failed",
                Kind::Timeout => "operation timed out",
                Kind::Encryption => "TLS handshake failed",
            })?,
        }

        if let Some(ref e) = self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    InvalidUri,
    Connect,
    Bind,
    AddressInUse,
    Accept,
    Timeout,
    Encryption,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

/// Scrubs a transient `hostname=` query parameter out of a `Connection to …`
/// message before the message is embedded in another error. The parameter is
/// an internal SNI hint; user-visible errors should show the URI the caller
/// supplied.
pub(crate) fn strip_hostname_param(msg: &str) -> String {
    if !msg.starts_with("Connection to ") {
        return msg.to_owned();
    }

    let Some(start) = msg.find("hostname=") else {
        return msg.to_owned();
    };

    // Include the preceding '?' or '&' in the cut.
    let cut_from = start.saturating_sub(1);
    let sep = msg.as_bytes().get(cut_from).copied();
    if sep != Some(b'?') && sep != Some(b'&') {
        return msg.to_owned();
    }

    let rest = &msg[start..];
    let end = rest
        .find(|c: char| c == '&' || c == '#' || c.is_whitespace())
        .map(|i| start + i)
        .unwrap_or(msg.len());

    let mut out = String::with_capacity(msg.len());
    out.push_str(&msg[..cut_from]);
    // A following '&' takes over the cut separator's position.
    if msg.as_bytes().get(end) == Some(&b'&') {
        out.push(sep.unwrap() as char);
        out.push_str(&msg[end + 1..]);
    } else {
        out.push_str(&msg[end..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Connect, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::connect("tcp://127.0.0.1:80", root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::timeout("tcp://example.com:80", 1.0);
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Connection to tcp://example.com:80 timed out after 1.00 seconds: operation timed out"
        );

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::connect("tcp://example.com:80", io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn connect_carries_os_code() {
        let io = io::Error::from_raw_os_error(111); // ECONNREFUSED
        let err = Error::connect("tcp://127.0.0.1:1", io);
        assert!(err.is_connect());
        assert_eq!(err.raw_os_error(), Some(111));
        assert_eq!(err.target(), Some("tcp://127.0.0.1:1"));
    }

    #[test]
    fn strips_hostname_hint() {
        let msg = "Connection to tcp://1.2.3.4:443?hostname=example.com failed: refused";
        assert_eq!(
            strip_hostname_param(msg),
            "Connection to tcp://1.2.3.4:443 failed: refused"
        );

        let msg = "Connection to tcp://1.2.3.4:443?a=b&hostname=x&c=d failed";
        assert_eq!(
            strip_hostname_param(msg),
            "Connection to tcp://1.2.3.4:443?a=b&c=d failed"
        );

        // Not a connection message: untouched.
        let msg = "listen error: hostname=x";
        assert_eq!(strip_hostname_param(msg), msg);
    }
}
