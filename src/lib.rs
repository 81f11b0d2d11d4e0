#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, deny(warnings))]

//! # socketry
//!
//! An asynchronous, event-driven socket library for tokio: URI-addressed
//! connectors and servers for TCP, TLS and Unix domain sockets.
//!
//! - [`Connector`]: client side. Turns `tcp://`, `tls://` and `unix://`
//!   targets into established [`Connection`]s, with DNS resolution,
//!   [RFC 8305 Happy Eyeballs](connect::HappyEyeballsConnector) dual-stack
//!   racing, connect timeouts and TLS upgrades layered as decorators.
//! - [`server`]: server side. [`Listener`]s for TCP, TLS, Unix sockets and
//!   inherited file descriptors, plus [connection limiting]
//!   (server::LimitingServer) with backpressure.
//!
//! ## Connecting
//!
//! ```rust,no_run
//! use socketry::Connector;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = Connector::new();
//!
//!     // Hostnames race AAAA/A per RFC 8305; the original hostname is
//!     // carried through for SNI when the scheme is tls://.
//!     let mut conn = connector.connect("tls://example.com:443").await?;
//!     conn.write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")
//!         .await?;
//!
//!     let mut response = Vec::new();
//!     let _ = conn.read_to_end(&mut response).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Serving
//!
//! ```rust,no_run
//! use socketry::server::{self, ListenerExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), socketry::Error> {
//!     let mut listener = server::bind("tcp://127.0.0.1:8080")?;
//!     while let Some(conn) = listener.accept().await {
//!         match conn {
//!             Ok(conn) => println!("connection from {:?}", conn.peer_addr()),
//!             Err(e) => eprintln!("accept error: {}", e),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Optional features
//!
//! - **hickory-dns**: DNS via hickory-resolver, with true per-family
//!   AAAA/A lookups and custom nameserver lists.

mod conn;
mod error;
mod target;
mod util;

pub mod connect;
pub mod dns;
pub mod server;
pub mod tls;

pub use self::conn::Connection;
pub use self::connect::{Connect, Connecting, Connector, ConnectorBuilder};
pub use self::error::{BoxError, Error, Result};
pub use self::server::{Listener, ListenerExt};
pub use self::target::{Host, Scheme, Target};
pub use self::tls::{TlsOptions, TlsVersion};

#[doc(hidden)]
pub use self::connect::probe::override_ipv6_probe;
