//! Client-side connectors.
//!
//! A connector turns a target URI into an established [`Connection`]. The
//! stack is compositional: leaf connectors ([`TcpConnector`],
//! [`UnixConnector`]) perform the actual socket work, and decorators add DNS
//! resolution ([`DnsConnector`]), RFC 8305 dual-stack racing
//! ([`HappyEyeballsConnector`]), connect timeouts ([`TimeoutConnector`]) and
//! TLS upgrades ([`TlsConnector`]). [`Connector`] is the facade which builds
//! the usual composition once and dispatches on the target scheme.

pub(crate) mod dns;
pub(crate) mod happy;
pub(crate) mod probe;
pub(crate) mod tcp;
pub(crate) mod timeout;
pub(crate) mod tls;
#[cfg(unix)]
pub(crate) mod unix;

pub use self::dns::DnsConnector;
pub use self::happy::HappyEyeballsConnector;
pub use self::tcp::{TcpConnector, TcpOptions};
pub use self::timeout::TimeoutConnector;
pub use self::tls::TlsConnector;
#[cfg(unix)]
pub use self::unix::UnixConnector;

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::conn::Connection;
use crate::dns::{DynResolver, GaiResolver, IntoResolve, OverrideResolver, Resolve};
use crate::error::{Error, Result};
use crate::tls::TlsOptions;

/// Alias for the boxed `Future` a connector returns.
pub type Connecting = Pin<Box<dyn Future<Output = Result<Connection>> + Send>>;

/// The seam every connector implements.
///
/// Dropping the returned future cancels the connection attempt: pending DNS
/// queries, socket connects and TLS handshakes are abandoned and any socket
/// held by the attempt is closed.
pub trait Connect: Send + Sync {
    /// Establishes a connection to the given target URI.
    fn connect(&self, target: &str) -> Connecting;
}

impl std::fmt::Debug for dyn Connect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Connect").finish()
    }
}

impl<C: Connect + ?Sized> Connect for Arc<C> {
    fn connect(&self, target: &str) -> Connecting {
        (**self).connect(target)
    }
}

/// Default total connect timeout applied by the facade.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

enum DnsSetting {
    Enabled,
    Disabled,
    Custom(Arc<dyn Resolve>),
}

/// A `ConnectorBuilder` can be used to create a [`Connector`] with custom
/// configuration.
#[must_use]
pub struct ConnectorBuilder {
    tcp: bool,
    tcp_options: TcpOptions,
    tls: bool,
    tls_options: TlsOptions,
    unix: bool,
    dns: DnsSetting,
    #[cfg(feature = "hickory-dns")]
    nameservers: Option<Vec<IpAddr>>,
    overrides: HashMap<String, Vec<IpAddr>>,
    timeout: Option<Duration>,
    happy_eyeballs: bool,
    ipv6_precheck: bool,
}

impl Default for ConnectorBuilder {
    fn default() -> Self {
        ConnectorBuilder {
            tcp: true,
            tcp_options: TcpOptions::default(),
            tls: true,
            tls_options: TlsOptions::default(),
            unix: true,
            dns: DnsSetting::Enabled,
            #[cfg(feature = "hickory-dns")]
            nameservers: None,
            overrides: HashMap::new(),
            timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            happy_eyeballs: true,
            ipv6_precheck: false,
        }
    }
}

impl ConnectorBuilder {
    /// Constructs a new `ConnectorBuilder` with the default configuration:
    /// all schemes enabled, DNS with Happy Eyeballs, a 60 second timeout.
    pub fn new() -> ConnectorBuilder {
        ConnectorBuilder::default()
    }

    /// Enables or disables the `tcp://` scheme.
    pub fn tcp(mut self, enabled: bool) -> Self {
        self.tcp = enabled;
        self
    }

    /// Socket options applied to outgoing TCP connections.
    pub fn tcp_options(mut self, options: TcpOptions) -> Self {
        self.tcp_options = options;
        self
    }

    /// Enables or disables the `tls://` scheme.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// TLS context options for the `tls://` scheme.
    pub fn tls_options(mut self, options: TlsOptions) -> Self {
        self.tls_options = options;
        self
    }

    /// Enables or disables the `unix://` scheme.
    pub fn unix(mut self, enabled: bool) -> Self {
        self.unix = enabled;
        self
    }

    /// Enables or disables hostname resolution. With DNS disabled only
    /// literal IP targets connect.
    pub fn dns(mut self, enabled: bool) -> Self {
        self.dns = if enabled {
            DnsSetting::Enabled
        } else {
            DnsSetting::Disabled
        };
        self
    }

    /// Uses a custom DNS resolver.
    pub fn dns_resolver(mut self, resolver: impl IntoResolve) -> Self {
        self.dns = DnsSetting::Custom(resolver.into_resolve());
        self
    }

    /// Queries the given nameservers instead of the system configuration.
    #[cfg(feature = "hickory-dns")]
    pub fn nameservers(mut self, servers: Vec<IpAddr>) -> Self {
        self.nameservers = Some(servers);
        self
    }

    /// Overrides DNS resolution for a specific host.
    pub fn resolve(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.overrides.insert(host.to_owned(), addrs.to_vec());
        self
    }

    /// Sets the total connect timeout. A zero duration disables the timeout
    /// entirely, as does [`no_timeout`](ConnectorBuilder::no_timeout).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
        self
    }

    /// Disables the connect timeout.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Enables or disables Happy Eyeballs racing for hostname targets.
    /// Disabled, hostnames resolve to a single address. Default is enabled.
    pub fn happy_eyeballs(mut self, enabled: bool) -> Self {
        self.happy_eyeballs = enabled;
        self
    }

    /// Probes IPv6 routability (with a process-wide 60 s cache) before racing
    /// and skips the AAAA query when IPv6 is unroutable. Default is disabled.
    pub fn ipv6_precheck(mut self, enabled: bool) -> Self {
        self.ipv6_precheck = enabled;
        self
    }

    /// Builds the [`Connector`].
    pub fn build(self) -> Result<Connector> {
        let resolver: Option<Arc<dyn Resolve>> = match self.dns {
            DnsSetting::Disabled => None,
            DnsSetting::Custom(resolver) => Some(resolver),
            DnsSetting::Enabled => {
                #[cfg(feature = "hickory-dns")]
                if let Some(servers) = self.nameservers {
                    Some(Arc::new(crate::dns::HickoryDnsResolver::with_nameservers(
                        servers,
                    )))
                } else {
                    Some(Arc::new(GaiResolver::new()))
                }
                #[cfg(not(feature = "hickory-dns"))]
                Some(Arc::new(GaiResolver::new()))
            }
        };
        let resolver = resolver.map(|r| {
            if self.overrides.is_empty() {
                r
            } else {
                Arc::new(OverrideResolver::new(r, self.overrides)) as Arc<dyn Resolve>
            }
        });

        let leaf = TcpConnector::new(self.tcp_options);

        let hostname_stack: Arc<dyn Connect> = match resolver {
            None => Arc::new(leaf),
            Some(resolver) => {
                let resolver = DynResolver::new(resolver);
                if self.happy_eyeballs {
                    Arc::new(
                        HappyEyeballsConnector::with_resolver(leaf, resolver)
                            .ipv6_precheck(self.ipv6_precheck),
                    )
                } else {
                    Arc::new(DnsConnector::with_resolver(leaf, resolver))
                }
            }
        };

        let tls = if self.tls {
            let secure = TlsConnector::new(hostname_stack.clone(), self.tls_options)?;
            Some(wrap_timeout(Arc::new(secure), self.timeout))
        } else {
            None
        };

        let tcp = self
            .tcp
            .then(|| wrap_timeout(hostname_stack.clone(), self.timeout));

        #[cfg(unix)]
        let unix = self
            .unix
            .then(|| wrap_timeout(Arc::new(UnixConnector::new()), self.timeout));

        Ok(Connector {
            inner: Arc::new(Inner {
                tcp,
                tls,
                #[cfg(unix)]
                unix,
            }),
        })
    }
}

fn wrap_timeout(inner: Arc<dyn Connect>, timeout: Option<Duration>) -> Arc<dyn Connect> {
    match timeout {
        Some(timeout) => Arc::new(TimeoutConnector::new(inner, timeout)),
        None => inner,
    }
}

/// The facade connector: dispatches a target URI to the composed stack for
/// its scheme (`tcp`, `tls` or `unix`; a schemeless `host:port` is `tcp`).
///
/// Cheap to clone; the decorator stacks are built once and shared.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    tcp: Option<Arc<dyn Connect>>,
    tls: Option<Arc<dyn Connect>>,
    #[cfg(unix)]
    unix: Option<Arc<dyn Connect>>,
}

impl Connector {
    /// Constructs a connector with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the default TLS backend cannot be initialized. Use
    /// [`Connector::builder()`] for a fallible construction.
    pub fn new() -> Connector {
        ConnectorBuilder::new()
            .build()
            .expect("default connector configuration is valid")
    }

    /// Creates a [`ConnectorBuilder`] to configure a `Connector`.
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::new()
    }

    /// Connects to the given target URI.
    pub async fn connect(&self, target: &str) -> Result<Connection> {
        Connect::connect(self, target).await
    }

    fn stack_for(&self, target: &str) -> Result<&Arc<dyn Connect>> {
        let scheme = match target.find("://") {
            Some(idx) => &target[..idx],
            None => "tcp",
        };
        let stack = match scheme {
            "tcp" => &self.inner.tcp,
            "tls" => &self.inner.tls,
            #[cfg(unix)]
            "unix" => &self.inner.unix,
            other => {
                return Err(Error::invalid_uri(format!(
                    "no connector available for scheme \"{}\"",
                    other
                )))
            }
        };
        stack.as_ref().ok_or_else(|| {
            Error::invalid_uri(format!(
                "no connector available for scheme \"{}\"",
                scheme
            ))
        })
    }
}

impl Default for Connector {
    fn default() -> Self {
        Connector::new()
    }
}

impl Connect for Connector {
    fn connect(&self, target: &str) -> Connecting {
        log::debug!("starting new connection: {}", target);
        match self.stack_for(target) {
            Ok(stack) => stack.connect(target),
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }
}
