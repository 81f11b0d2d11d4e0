//! DNS resolution
//!
//! The connector stacks consume resolvers through the [`Resolve`] trait,
//! which supports both one-shot resolution (first usable address) and
//! per-family lookups, the shape the Happy Eyeballs builder needs to race
//! AAAA and A queries.

pub(crate) mod gai;
#[cfg(feature = "hickory-dns")]
pub(crate) mod hickory;
pub(crate) mod resolve;

pub use resolve::{Family, IntoResolve, Name, Resolve, Resolving};

#[cfg(feature = "hickory-dns")]
pub use self::hickory::HickoryDnsResolver;
pub(crate) use self::{
    gai::GaiResolver,
    resolve::{DynResolver, OverrideResolver},
};
