//! Dual-write proxy for the Cassandra native protocol.
//!
//! Clients connect to the proxy as if it were a regular node. Every request
//! frame is mirrored to two independent clusters: the *source*, whose
//! responses the client sees, and the *target*, which is warmed by the same
//! traffic while its responses are compared for divergence and dropped. This
//! keeps a migration target in lockstep with production writes without any
//! client change.
//!
//! The interesting machinery is per connection: native-protocol framing,
//! stream-id correlation of out-of-order responses from two upstreams,
//! backpressure coupling across three sockets, optional rewriting of inline
//! `uuid()` / `now()` calls so both clusters store identical values, and
//! protocol-version gatekeeping.
//!
//! ```rust,no_run
//! use cql_mirror::{ClusterConfig, ProxyConfig, Server};
//!
//! fn main() -> Result<(), cql_mirror::ProxyError> {
//!     let config = ProxyConfig {
//!         source: ClusterConfig::new("10.0.0.1", 9042, "prod"),
//!         target: ClusterConfig::new("10.0.0.2", 9042, "migration"),
//!         proxy_port: 9042,
//!         upstream_tls: false,
//!         ..ProxyConfig::default()
//!     };
//!     Server::new(config)?.run()
//! }
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod guard;
pub mod metrics;
pub mod rewrite;
pub mod server;
pub mod session;
pub mod tls;
pub mod upstream;


pub use config::{ClusterConfig, ProxyConfig, TlsIdentity};
pub use error::{ProxyError, Result};
pub use frame::{Frame, FrameHeader, FrameKind, Opcode};
pub use metrics::ProxyMetrics;
pub use server::Server;
pub use session::Session;
