use std::sync::Arc;

use super::{Connect, Connecting};
use crate::error::{strip_hostname_param, Error};
use crate::target::{Scheme, Target};
use crate::tls::handshake::Handshake;
use crate::tls::TlsOptions;

/// The secure connector decorator.
///
/// Connects in plaintext through the underlying stack (to `tcp://host:port`,
/// query and hostname hint preserved) and then upgrades the stream with a
/// client-side TLS handshake. SNI and peer verification use, in order: the
/// `peer_name` option, the `?hostname=` hint attached by a DNS layer, the
/// target host itself.
pub struct TlsConnector<C> {
    inner: C,
    options: Arc<TlsOptions>,
    connector: tokio_rustls::TlsConnector,
}

impl<C> TlsConnector<C> {
    /// Wraps `inner`, building the TLS client context from `options`.
    pub fn new(inner: C, options: TlsOptions) -> crate::Result<TlsConnector<C>> {
        let config = options.client_config()?;
        Ok(TlsConnector {
            inner,
            options: Arc::new(options),
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

impl<C> Connect for TlsConnector<C>
where
    C: Connect + Clone + 'static,
{
    fn connect(&self, target: &str) -> Connecting {
        let inner = self.inner.clone();
        let options = Arc::clone(&self.options);
        let tls = self.connector.clone();
        let target = target.to_owned();
        Box::pin(async move {
            // A schemeless target is assumed to be tls://.
            let parsed = Target::parse(&target, Scheme::Tls)?;
            if parsed.scheme() != Scheme::Tls {
                return Err(Error::invalid_uri(format!(
                    "invalid URI \"{}\": TLS connector requires the tls:// scheme",
                    target
                )));
            }
            let uri = parsed.to_string();

            let plain = parsed.with_scheme(Scheme::Tcp).to_string();
            let conn = inner.connect(&plain).await.map_err(|e| {
                let cause = strip_hostname_param(&e.to_string());
                Error::connect_msg(&uri, format!("Connection to {} failed: {}", uri, cause))
            })?;

            let peer_name = options
                .peer_name_override()
                .map(str::to_owned)
                .or_else(|| conn.sni_hint().map(str::to_owned))
                .unwrap_or_else(|| parsed.host_str());

            let server_name =
                rustls::ServerName::try_from(peer_name.as_str()).map_err(|_| {
                    Error::encryption_msg(format!(
                        "Connection to {} failed during TLS handshake: invalid peer name \"{}\"",
                        uri, peer_name
                    ))
                })?;

            let (stream, _) = conn.into_tcp()?;
            log::trace!("TLS handshake with {} (peer name {})", uri, peer_name);
            Handshake::Client(tls.connect(server_name, stream))
                .await
                .map_err(|e| Error::encryption(&uri, e))
        })
    }
}
