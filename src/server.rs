// ABOUTME: Listener setup and accept loops: N independent acceptor threads, one session task per client
// ABOUTME: Bind and TLS credential problems fail startup; per-connection failures only log

use crate::config::ProxyConfig;
use crate::connection::Connection;
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::session::Session;
use crate::tls;
use crate::upstream::{SupportedOverride, UpstreamLink};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info, warn};

/// The proxy server: validates configuration up front, then runs `threads`
/// independent listener instances, each pinned to its own thread with a
/// single-threaded runtime. Every accepted client gets one task owning its
/// three sockets.
pub struct Server {
    config: Arc<ProxyConfig>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    metrics: ProxyMetrics,
}

impl Server {
    /// Prepare shared state. TLS credential problems surface here rather than
    /// on the first accepted connection.
    pub fn new(config: ProxyConfig) -> Result<Server, ProxyError> {
        if config.threads == 0 {
            return Err(ProxyError::Config("threads must be at least 1".into()));
        }
        let acceptor = config.tls.as_ref().map(tls::acceptor).transpose()?;
        let connector = config.upstream_tls.then(tls::trust_all_connector);
        let metrics = ProxyMetrics::new(config.metrics);
        Ok(Server {
            config: Arc::new(config),
            acceptor,
            connector,
            metrics,
        })
    }

    /// Run until a listener fails. Blocks the calling thread.
    pub fn run(self) -> Result<(), ProxyError> {
        let mut handles = Vec::with_capacity(self.config.threads);
        for instance in 0..self.config.threads {
            let config = Arc::clone(&self.config);
            let acceptor = self.acceptor.clone();
            let connector = self.connector.clone();
            let metrics = self.metrics.clone();
            let handle = std::thread::Builder::new()
                .name(format!("listener-{instance}"))
                .spawn(move || listener_thread(config, acceptor, connector, metrics))?;
            handles.push(handle);
        }
        for handle in handles {
            match handle.join() {
                Ok(outcome) => outcome?,
                Err(_) => return Err(ProxyError::Config("listener thread panicked".into())),
            }
        }
        Ok(())
    }
}

fn listener_thread(
    config: Arc<ProxyConfig>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    metrics: ProxyMetrics,
) -> Result<(), ProxyError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(accept_loop(config, acceptor, connector, metrics)))
}

async fn accept_loop(
    config: Arc<ProxyConfig>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    metrics: ProxyMetrics,
) -> Result<(), ProxyError> {
    let listener = bind(config.proxy_port, config.threads > 1)?;
    info!(port = config.proxy_port, "listening for client connections");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let config = Arc::clone(&config);
        let acceptor = acceptor.clone();
        let connector = connector.clone();
        let metrics = metrics.clone();
        tokio::task::spawn_local(handle_client(
            stream, peer, config, acceptor, connector, metrics,
        ));
    }
}

/// Bind the listen socket. With more than one listener instance the port is
/// shared via SO_REUSEPORT so the kernel spreads accepts across threads.
fn bind(port: u16, share_port: bool) -> Result<TcpListener, ProxyError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    if share_port {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    metrics: ProxyMetrics,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(client = %peer, error = %e, "could not set nodelay");
    }

    let client = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Connection::new(tls_stream, config.max_frame_length),
            Err(e) => {
                warn!(client = %peer, error = %e, "tls handshake failed");
                return;
            }
        },
        None => Connection::new(stream, config.max_frame_length),
    };

    // SUPPORTED interception applies to the source link only; the target's
    // responses never reach the client.
    let overrides = SupportedOverride {
        protocol_versions: config.protocol_versions.clone(),
        cql_versions: config.cql_versions.clone(),
    };
    let source = match UpstreamLink::connect(
        &config.source,
        connector.as_ref(),
        config.max_frame_length,
        Some(overrides),
    )
    .await
    {
        Ok(link) => link,
        Err(e) => {
            error!(client = %peer, cluster = %config.source.identifier, error = %e, "cannot reach upstream, dropping client");
            return;
        }
    };
    let target = match UpstreamLink::connect(
        &config.target,
        connector.as_ref(),
        config.max_frame_length,
        None,
    )
    .await
    {
        Ok(link) => link,
        Err(e) => {
            error!(client = %peer, cluster = %config.target.identifier, error = %e, "cannot reach upstream, dropping client");
            return;
        }
    };

    let session = Session::new(client, peer.to_string(), source, target, &config, metrics);
    match session.run().await {
        Ok(()) => info!(client = %peer, "session closed"),
        Err(e) => warn!(client = %peer, error = %e, "session aborted"),
    }
}
