use std::{collections::HashMap, fmt, future::Future, net::IpAddr, pin::Pin, sync::Arc};

use crate::error::BoxError;

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from a string slice.
    #[inline]
    pub fn new(host: Box<str>) -> Name {
        Name { host }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value.into())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// The address family of a DNS query: `A` or `AAAA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4, the `A` record type.
    V4,
    /// IPv6, the `AAAA` record type.
    V6,
}

impl Family {
    /// The record type label (`A` / `AAAA`).
    pub fn record_type(self) -> &'static str {
        match self {
            Family::V4 => "A",
            Family::V6 => "AAAA",
        }
    }

    /// The family label used in composed error messages.
    pub fn label(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    pub(crate) fn matches(self, ip: IpAddr) -> bool {
        match self {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, BoxError>> + Send>>;

/// Trait for customizing DNS resolution in socketry.
pub trait Resolve: Send + Sync {
    /// Resolves a `Name` into addresses, in preference order. An empty list
    /// is a successful lookup that yielded no records.
    fn resolve(&self, name: Name) -> Resolving;

    /// Resolves only the records of one address family.
    ///
    /// The default implementation filters the result of [`resolve`]
    /// (Resolve::resolve); resolvers capable of issuing single-family
    /// queries (like the hickory backend) override it.
    fn resolve_family(&self, name: Name, family: Family) -> Resolving {
        let all = self.resolve(name);
        Box::pin(async move {
            let addrs = all.await?;
            Ok(addrs.into_iter().filter(|ip| family.matches(*ip)).collect())
        })
    }
}

/// Trait for converting types into a shared DNS resolver ([`Arc<dyn Resolve>`]).
pub trait IntoResolve {
    /// Converts the implementor into an [`Arc<dyn Resolve>`].
    fn into_resolve(self) -> Arc<dyn Resolve>;
}

impl IntoResolve for Arc<dyn Resolve> {
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for Arc<R>
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for R
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        Arc::new(self)
    }
}

/// Cheaply cloneable handle to a shared resolver.
#[derive(Clone)]
pub(crate) struct DynResolver {
    resolver: Arc<dyn Resolve>,
}

impl DynResolver {
    pub(crate) fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver }
    }

    pub(crate) fn resolve(&self, name: Name) -> Resolving {
        self.resolver.resolve(name)
    }

    pub(crate) fn resolve_family(&self, name: Name, family: Family) -> Resolving {
        self.resolver.resolve_family(name, family)
    }
}

/// Resolver that consults manual hostname-to-IP mappings before falling back
/// to the wrapped resolver. Useful for testing or bypassing DNS for specific
/// hosts.
pub(crate) struct OverrideResolver {
    fallback: Arc<dyn Resolve>,
    overrides: Arc<HashMap<String, Vec<IpAddr>>>,
}

impl OverrideResolver {
    pub(crate) fn new(
        fallback: Arc<dyn Resolve>,
        overrides: HashMap<String, Vec<IpAddr>>,
    ) -> Self {
        OverrideResolver {
            fallback,
            overrides: Arc::new(overrides),
        }
    }
}

impl Resolve for OverrideResolver {
    fn resolve(&self, name: Name) -> Resolving {
        match self.overrides.get(name.as_str()) {
            Some(addrs) => {
                let addrs = addrs.clone();
                Box::pin(std::future::ready(Ok(addrs)))
            }
            None => self.fallback.resolve(name),
        }
    }

    fn resolve_family(&self, name: Name, family: Family) -> Resolving {
        match self.overrides.get(name.as_str()) {
            Some(addrs) => {
                let addrs: Vec<IpAddr> = addrs
                    .iter()
                    .copied()
                    .filter(|ip| family.matches(*ip))
                    .collect();
                Box::pin(std::future::ready(Ok(addrs)))
            }
            None => self.fallback.resolve_family(name, family),
        }
    }
}
