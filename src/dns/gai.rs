use crate::dns::{Name, Resolve, Resolving};

/// Resolver backed by the system's `getaddrinfo`, run on tokio's blocking
/// pool via [`tokio::net::lookup_host`].
///
/// `getaddrinfo` cannot issue a single-family query, so per-family lookups
/// filter one combined result set. The `hickory-dns` feature provides a
/// resolver with true AAAA/A splitting.
#[derive(Debug, Clone, Default)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Constructs a new `GaiResolver`.
    pub fn new() -> Self {
        GaiResolver { _priv: () }
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(crate::error::BoxError::from)?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}
