//! DNS resolution via the [hickory-resolver](https://github.com/hickory-dns/hickory-dns) crate

use std::net::IpAddr;
use std::sync::Arc;

use hickory_resolver::{
    config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};
use once_cell::sync::Lazy;

use super::{Family, Name, Resolve, Resolving};

/// Wrapper around a [`TokioAsyncResolver`] which implements the [`Resolve`]
/// trait, with true per-family AAAA/A lookups.
#[derive(Clone)]
pub struct HickoryDnsResolver {
    resolver: Arc<TokioAsyncResolver>,
}

/// Shared default instance, lazily initialized from the system configuration
/// with a fallback to the defaults when `/etc/resolv.conf` is unreadable.
static SYSTEM: Lazy<Arc<TokioAsyncResolver>> = Lazy::new(|| {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => {
            log::debug!("using system DNS configuration");
            resolver
        }
        Err(err) => {
            log::debug!("error reading DNS system conf: {}, using defaults", err);
            let mut opts = ResolverOpts::default();
            opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
            TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
        }
    };
    Arc::new(resolver)
});

impl HickoryDnsResolver {
    /// Create a resolver from the system configuration.
    pub fn new() -> HickoryDnsResolver {
        HickoryDnsResolver {
            resolver: Arc::clone(&SYSTEM),
        }
    }

    /// Create a resolver that queries the given nameservers over plain UDP/TCP
    /// on port 53.
    pub fn with_nameservers(servers: Vec<IpAddr>) -> HickoryDnsResolver {
        let group = NameServerConfigGroup::from_ips_clear(&servers, 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut opts = ResolverOpts::default();
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        HickoryDnsResolver {
            resolver: Arc::new(TokioAsyncResolver::tokio(config, opts)),
        }
    }
}

impl Default for HickoryDnsResolver {
    fn default() -> Self {
        HickoryDnsResolver::new()
    }
}

/// A successful lookup with no records comes back as an error from hickory;
/// the connector layers treat it as an empty record set.
fn no_records_is_empty<T>(
    result: Result<Vec<T>, hickory_resolver::error::ResolveError>,
) -> Result<Vec<T>, crate::error::BoxError> {
    match result {
        Ok(addrs) => Ok(addrs),
        Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

impl Resolve for HickoryDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let result = resolver
                .resolver
                .lookup_ip(name.as_str())
                .await
                .map(|lookup| lookup.iter().collect());
            no_records_is_empty(result)
        })
    }

    fn resolve_family(&self, name: Name, family: Family) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            match family {
                Family::V4 => {
                    let result = resolver
                        .resolver
                        .ipv4_lookup(name.as_str())
                        .await
                        .map(|lookup| lookup.iter().map(|a| IpAddr::V4(a.0)).collect());
                    no_records_is_empty(result)
                }
                Family::V6 => {
                    let result = resolver
                        .resolver
                        .ipv6_lookup(name.as_str())
                        .await
                        .map(|lookup| lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect());
                    no_records_is_empty(result)
                }
            }
        })
    }
}
