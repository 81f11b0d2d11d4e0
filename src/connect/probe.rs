//! IPv6 routability probing.
//!
//! `connect()` on an unconnected UDP socket performs a route lookup without
//! sending any packet; a failure means the host has no route to public IPv6.
//! The result is cached process-wide for [`CACHE_TTL`], since interface
//! changes are rare and the probe sits on the connect hot path.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// A well-known public IPv6 address (Google Public DNS); only the route
/// lookup matters, nothing is sent.
const PROBE_TARGET: Ipv6Addr = Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888);

struct Cache {
    checked_at: Option<Instant>,
    routable: bool,
    forced: Option<bool>,
}

static CACHE: Lazy<Mutex<Cache>> = Lazy::new(|| {
    Mutex::new(Cache {
        checked_at: None,
        routable: false,
        forced: None,
    })
});

pub(crate) fn ipv6_routable() -> bool {
    let mut cache = CACHE.lock().unwrap();
    if let Some(forced) = cache.forced {
        return forced;
    }
    if let Some(at) = cache.checked_at {
        if at.elapsed() < CACHE_TTL {
            return cache.routable;
        }
    }

    let routable = probe();
    log::debug!("IPv6 routability probe: {}", routable);
    cache.checked_at = Some(Instant::now());
    cache.routable = routable;
    routable
}

fn probe() -> bool {
    let bind = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
    match UdpSocket::bind(bind) {
        Ok(socket) => socket
            .connect(SocketAddr::new(IpAddr::V6(PROBE_TARGET), 53))
            .is_ok(),
        Err(_) => false,
    }
}

/// Forces the probe result, bypassing both the probe and the cache. Passing
/// `None` restores probing. Intended for tests.
#[doc(hidden)]
pub fn override_ipv6_probe(forced: Option<bool>) {
    CACHE.lock().unwrap().forced = forced;
}
