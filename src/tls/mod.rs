//! TLS context configuration.
//!
//! [`TlsOptions`] carries the certificate, verification and protocol-version
//! settings consumed by the secure connector and server. Client and server
//! rustls configs are built from one options value; relaxed verification
//! (`verify_peer`, `verify_peer_name`, `allow_self_signed`) is implemented
//! with a custom certificate verifier wrapping the webpki one.

pub(crate) mod handshake;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{Certificate, OwnedTrustAnchor, PrivateKey, RootCertStore, SupportedProtocolVersion};

use crate::error::{Error, Result};

/// A TLS protocol version.
///
/// rustls only speaks TLS 1.2 and 1.3; older versions cannot be selected.
#[derive(Debug, Clone, Copy)]
pub struct TlsVersion(&'static SupportedProtocolVersion);

impl TlsVersion {
    /// Version 1.2 of the TLS protocol.
    pub const TLS_1_2: TlsVersion = TlsVersion(&rustls::version::TLS12);

    /// Version 1.3 of the TLS protocol.
    pub const TLS_1_3: TlsVersion = TlsVersion(&rustls::version::TLS13);

    fn rank(self) -> u8 {
        if std::ptr::eq(self.0, &rustls::version::TLS13) {
            1
        } else {
            0
        }
    }
}

/// TLS options for secure connectors and servers.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    local_cert: Option<PathBuf>,
    local_pk: Option<PathBuf>,
    passphrase: Option<String>,
    root_certs: Vec<PathBuf>,
    no_verify_peer: bool,
    no_verify_peer_name: bool,
    allow_self_signed: bool,
    peer_name: Option<String>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
}

impl TlsOptions {
    /// Default options: peer and peer-name verification on, webpki roots.
    pub fn new() -> TlsOptions {
        TlsOptions::default()
    }

    /// Path to the PEM file with the server certificate chain (server side).
    /// The private key is read from the same file unless [`local_pk`]
    /// (TlsOptions::local_pk) names a separate one.
    pub fn local_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_cert = Some(path.into());
        self
    }

    /// Path to the PEM file with the server private key.
    pub fn local_pk(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_pk = Some(path.into());
        self
    }

    /// Passphrase of the private key.
    ///
    /// Encrypted PEM keys are not supported by the rustls backend; setting
    /// this produces a configuration error at build time rather than being
    /// silently ignored.
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Adds a PEM file of additional trusted root certificates.
    pub fn add_root_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_certs.push(path.into());
        self
    }

    /// Controls peer certificate verification. Defaults to `true`.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.no_verify_peer = !verify;
        self
    }

    /// Controls peer name verification. Defaults to `true`.
    pub fn verify_peer_name(mut self, verify: bool) -> Self {
        self.no_verify_peer_name = !verify;
        self
    }

    /// Accept self-signed certificates. Defaults to `false`.
    pub fn allow_self_signed(mut self, allow: bool) -> Self {
        self.allow_self_signed = allow;
        self
    }

    /// Overrides the SNI / verification name. When unset, the `?hostname=`
    /// hint carried by the plaintext connection (or the target host itself)
    /// is used.
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    /// Minimum accepted TLS protocol version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Maximum accepted TLS protocol version.
    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    pub(crate) fn peer_name_override(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    fn protocol_versions(&self) -> Result<Vec<&'static SupportedProtocolVersion>> {
        let all = [TlsVersion::TLS_1_2, TlsVersion::TLS_1_3];
        let versions: Vec<_> = all
            .iter()
            .filter(|v| self.min_version.map_or(true, |min| v.rank() >= min.rank()))
            .filter(|v| self.max_version.map_or(true, |max| v.rank() <= max.rank()))
            .map(|v| v.0)
            .collect();
        if versions.is_empty() {
            return Err(Error::invalid_uri(
                "TLS configuration selects no protocol versions",
            ));
        }
        Ok(versions)
    }

    fn check_passphrase(&self) -> Result<()> {
        if self.passphrase.is_some() {
            return Err(Error::invalid_uri(
                "encrypted private keys are not supported; provide an unencrypted PEM key",
            ));
        }
        Ok(())
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        for path in &self.root_certs {
            let ders = read_pem_certs(path)?;
            let (added, ignored) = roots.add_parsable_certificates(&ders);
            log::trace!(
                "added {} root certificates from {} ({} ignored)",
                added,
                path.display(),
                ignored
            );
        }
        Ok(roots)
    }

    /// Builds the rustls client configuration.
    pub(crate) fn client_config(&self) -> Result<rustls::ClientConfig> {
        self.check_passphrase()?;
        let roots = self.root_store()?;
        let verifier_roots = roots.clone();

        let mut config = rustls::ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&self.protocol_versions()?)
            .map_err(|e| Error::invalid_uri(format!("invalid TLS configuration: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        if self.no_verify_peer {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoVerifier));
        } else if self.allow_self_signed || self.no_verify_peer_name {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::RelaxedVerifier::new(
                    verifier_roots,
                    self.allow_self_signed,
                    !self.no_verify_peer_name,
                )));
        }

        Ok(config)
    }

    /// Builds the rustls server configuration.
    pub(crate) fn server_config(&self) -> Result<rustls::ServerConfig> {
        self.check_passphrase()?;

        let cert_path = self.local_cert.as_deref().ok_or_else(|| {
            Error::invalid_uri("a TLS server requires the local_cert option")
        })?;
        let certs: Vec<Certificate> = read_pem_certs(cert_path)?
            .into_iter()
            .map(Certificate)
            .collect();
        if certs.is_empty() {
            return Err(Error::invalid_uri(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let key_path = self.local_pk.as_deref().unwrap_or(cert_path);
        let key = read_pem_key(key_path)?;

        rustls::ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&self.protocol_versions()?)
            .map_err(|e| Error::invalid_uri(format!("invalid TLS configuration: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::invalid_uri(format!("invalid certificate or key: {}", e)))
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::invalid_uri(format!("unable to read {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn read_pem_certs(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::invalid_uri(format!("invalid PEM in {}: {}", path.display(), e)))
}

fn read_pem_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = open_pem(path)?;
    for item in rustls_pemfile::read_all(&mut reader)
        .map_err(|e| Error::invalid_uri(format!("invalid PEM in {}: {}", path.display(), e)))?
    {
        match item {
            rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::ECKey(der) => return Ok(PrivateKey(der)),
            _ => continue,
        }
    }
    Err(Error::invalid_uri(format!(
        "no private key found in {}",
        path.display()
    )))
}

mod danger {
    use std::time::SystemTime;

    use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
    use rustls::{Certificate, CertificateError, RootCertStore, ServerName};

    /// Accepts any certificate: `verify_peer = false`.
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
    }

    /// Runs full webpki verification but forgives exactly the failures the
    /// options allow: an unknown issuer when self-signed certificates are
    /// accepted, a name mismatch when peer-name verification is off.
    pub(super) struct RelaxedVerifier {
        inner: WebPkiVerifier,
        allow_self_signed: bool,
        verify_name: bool,
    }

    impl RelaxedVerifier {
        pub(super) fn new(
            roots: RootCertStore,
            allow_self_signed: bool,
            verify_name: bool,
        ) -> RelaxedVerifier {
            RelaxedVerifier {
                inner: WebPkiVerifier::new(roots, None),
                allow_self_signed,
                verify_name,
            }
        }
    }

    impl ServerCertVerifier for RelaxedVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &Certificate,
            intermediates: &[Certificate],
            server_name: &ServerName,
            scts: &mut dyn Iterator<Item = &[u8]>,
            ocsp_response: &[u8],
            now: SystemTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                scts,
                ocsp_response,
                now,
            ) {
                Ok(verified) => Ok(verified),
                Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
                    if self.allow_self_signed =>
                {
                    Ok(ServerCertVerified::assertion())
                }
                Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
                    if !self.verify_name =>
                {
                    Ok(ServerCertVerified::assertion())
                }
                Err(e) => Err(e),
            }
        }
    }
}
