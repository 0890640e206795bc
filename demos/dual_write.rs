// ABOUTME: Runnable dual-write proxy wiring CLI flags into a ProxyConfig
// ABOUTME: Mirrors client traffic to a source and a target cluster; source answers win

//! # Dual-write proxy demo
//!
//! Listens for native-protocol clients and mirrors every request to two
//! clusters. Responses from the source cluster are returned to the client;
//! target responses are compared and dropped.
//!
//! ## Usage
//!
//! ```bash
//! # Plain TCP clusters side by side on localhost
//! cargo run --example dual_write -- \
//!   --source-host 127.0.0.1 --source-port 9042 \
//!   --target-host 127.0.0.1 --target-port 9043 \
//!   --port 9044 --plain-upstreams
//!
//! # Deterministic uuid()/now() across both clusters, protocol v4 only
//! cargo run --example dual_write -- --uuid --protocol-versions 4
//! ```

use argh::FromArgs;
use cql_mirror::{ClusterConfig, ProxyConfig, Server, TlsIdentity};
use std::error::Error;
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Dual-write proxy for the Cassandra native protocol
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// source cluster host, authoritative for responses (default: 127.0.0.1)
    #[argh(option, default = "String::from(\"127.0.0.1\")")]
    source_host: String,

    /// source cluster port (default: 9042)
    #[argh(option, default = "9042")]
    source_port: u16,

    /// source cluster label used in metrics and logs (default: source)
    #[argh(option, default = "String::from(\"source\")")]
    source_id: String,

    /// target cluster host, written to but never answering clients (default: 127.0.0.1)
    #[argh(option, default = "String::from(\"127.0.0.1\")")]
    target_host: String,

    /// target cluster port (default: 9043)
    #[argh(option, default = "9043")]
    target_port: u16,

    /// target cluster label used in metrics and logs (default: target)
    #[argh(option, default = "String::from(\"target\")")]
    target_id: String,

    /// port to listen on for clients (default: 9044)
    #[argh(option, short = 'p', default = "9044")]
    port: u16,

    /// number of listener threads (default: 1)
    #[argh(option, default = "1")]
    threads: usize,

    /// respond to the client as soon as the source answers instead of
    /// waiting for both clusters
    #[argh(switch)]
    no_wait: bool,

    /// rewrite inline uuid()/now() calls so both clusters store the same values
    #[argh(switch)]
    uuid: bool,

    /// comma-separated protocol versions to accept, e.g. "3,4"
    #[argh(option)]
    protocol_versions: Option<String>,

    /// comma-separated CQL versions to advertise, e.g. "3.4.5"
    #[argh(option)]
    cql_versions: Option<String>,

    /// PEM certificate chain for client-facing TLS
    #[argh(option)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for client-facing TLS
    #[argh(option)]
    tls_key: Option<PathBuf>,

    /// connect to the clusters over plain TCP instead of trust-all TLS
    #[argh(switch)]
    plain_upstreams: bool,

    /// disable metric emission
    #[argh(switch)]
    no_metrics: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: CliArgs = argh::from_env();

    let level = if args.debugging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let tls = match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => Some(TlsIdentity { cert, key }),
        (None, None) => None,
        _ => return Err("--tls-cert and --tls-key must be given together".into()),
    };

    let protocol_versions = match args.protocol_versions {
        Some(list) => list
            .split(',')
            .map(|v| v.trim().parse::<u8>())
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let cql_versions = match args.cql_versions {
        Some(list) => list.split(',').map(|v| v.trim().to_string()).collect(),
        None => Vec::new(),
    };

    let config = ProxyConfig {
        source: ClusterConfig::new(args.source_host, args.source_port, args.source_id),
        target: ClusterConfig::new(args.target_host, args.target_port, args.target_id),
        proxy_port: args.port,
        tls,
        threads: args.threads,
        wait: !args.no_wait,
        uuid: args.uuid,
        protocol_versions,
        cql_versions,
        metrics: !args.no_metrics,
        upstream_tls: !args.plain_upstreams,
        ..ProxyConfig::default()
    };

    info!(
        source = %config.source.address(),
        target = %config.target.address(),
        port = config.proxy_port,
        "starting dual-write proxy"
    );
    Server::new(config)?.run()?;
    Ok(())
}
