//! A SOCKS4/SOCKS4A/SOCKS5 proxy server library
//!
//! ## Implementation
//!
//! - Features:
//!     - SOCKS4 CONNECT, SOCKS4A hostname requests and the resolve-only extension
//!     - SOCKS5 CONNECT and BIND, IPv4 and domain name destinations
//!     - No Authentication
//!     - Mirror mode: every client is forwarded to one fixed target
//!     - IPv4 allow/deny lists with CIDR prefixes
//!     - One tokio task per client, reaped by the supervisor
//!     - Scoped resource ledger for ordered teardown on shutdown
//! - [SOCKS4](https://www.openssh.com/txt/socks4.protocol)
//! - [SOCKS4A](https://www.openssh.com/txt/socks4a.protocol)
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use nylon::{AccessList, ConnectionDescriptor, Ledger, Server, Shutdown};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let access = AccessList::configure("127.0.0.1", "").await?;
//!     let mut server = Server::new(
//!         vec!["127.0.0.1:1080".parse()?],
//!         Arc::new(ConnectionDescriptor::default()),
//!         Arc::new(access),
//!     );
//!     server.bind()?;
//!     server
//!         .run_until(Ledger::new(), async {
//!             let _ = tokio::signal::ctrl_c().await;
//!             Shutdown::Terminate
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod address;
pub mod config;
pub mod ledger;
pub mod monitor;
pub mod negotiate;
pub mod pidfile;
pub mod relay;
pub mod server;
pub mod socks4;
pub mod socks5;

// Re-export main types at crate root for convenience
pub use access::AccessList;
pub use config::{Args, Settings};
pub use ledger::{Ledger, LedgerKey};
pub use monitor::Shutdown;
pub use negotiate::{ConnectionDescriptor, Negotiation, Support};
pub use relay::{RelaySession, Teardown, Termination};
pub use server::Server;
