// ABOUTME: One outbound cluster connection per client session, plain TCP or trust-all TLS
// ABOUTME: Carries the SUPPORTED interception hook and the pause flag driven by backpressure

use crate::codec;
use crate::config::ClusterConfig;
use crate::connection::Connection;
use crate::error::ProxyError;
use crate::frame::{Frame, FrameKind};
use std::io;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Values to splice into SUPPORTED responses coming back from the source
/// cluster. Empty lists leave the corresponding option untouched.
#[derive(Debug, Clone, Default)]
pub struct SupportedOverride {
    pub protocol_versions: Vec<u8>,
    pub cql_versions: Vec<String>,
}

impl SupportedOverride {
    pub fn is_empty(&self) -> bool {
        self.protocol_versions.is_empty() && self.cql_versions.is_empty()
    }
}

/// The proxy's side of one upstream cluster connection.
///
/// Owned by a single session; requests are written through [`queue`] /
/// [`flush`] and responses come back through [`read_frame`] for the session
/// to correlate by stream id. Pause/resume is driven by the backpressure
/// coordinator while a client write is in flight.
///
/// [`queue`]: UpstreamLink::queue
/// [`flush`]: UpstreamLink::flush
/// [`read_frame`]: UpstreamLink::read_frame
pub struct UpstreamLink {
    conn: Connection,
    identifier: String,
    address: String,
    paused: bool,
    supported_override: Option<SupportedOverride>,
}

impl UpstreamLink {
    /// Open the upstream socket. With a connector, the stream is wrapped in
    /// TLS; server certificates are not verified (trust-all policy).
    pub async fn connect(
        cluster: &ClusterConfig,
        tls: Option<&TlsConnector>,
        max_frame_length: usize,
        supported_override: Option<SupportedOverride>,
    ) -> Result<UpstreamLink, ProxyError> {
        let tcp = TcpStream::connect((cluster.host.as_str(), cluster.port)).await?;
        tcp.set_nodelay(true)?;
        let conn = match tls {
            Some(connector) => {
                let name = rustls::pki_types::ServerName::try_from(cluster.host.clone())
                    .map_err(|_| ProxyError::ServerName(cluster.host.clone()))?;
                Connection::new(connector.connect(name, tcp).await?, max_frame_length)
            }
            None => Connection::new(tcp, max_frame_length),
        };
        debug!(cluster = %cluster.identifier, address = %cluster.address(), "upstream connected");
        Ok(UpstreamLink::new(
            conn,
            cluster.identifier.clone(),
            cluster.address(),
            supported_override,
        ))
    }

    /// Wrap an already-established connection.
    pub fn new(
        conn: Connection,
        identifier: String,
        address: String,
        supported_override: Option<SupportedOverride>,
    ) -> UpstreamLink {
        let supported_override = supported_override.filter(|o| !o.is_empty());
        UpstreamLink {
            conn,
            identifier,
            address,
            paused: false,
            supported_override,
        }
    }

    /// Enqueue a request frame for this cluster without waiting for the
    /// socket; pair with [`flush`](UpstreamLink::flush). The orchestrator
    /// queues to both clusters before either drain is awaited.
    pub async fn queue(&mut self, frame: &Frame) -> io::Result<()> {
        self.conn.queue_frame(frame).await
    }

    /// Drain queued frames to the socket.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.conn.flush().await
    }

    /// Next response frame from this cluster; `None` on clean close.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        self.conn.read_frame().await
    }

    /// SUPPORTED interception. The one place where forwarded bytes may
    /// intentionally differ from what the upstream sent: advertised protocol
    /// and CQL versions are replaced with the configured values. Anything
    /// that fails to decode is forwarded as received.
    pub fn filter_response(&self, frame: Frame) -> Frame {
        let Some(overrides) = &self.supported_override else {
            return frame;
        };
        if frame.kind() != FrameKind::Supported {
            return frame;
        }
        match codec::override_supported(
            &frame,
            &overrides.protocol_versions,
            &overrides.cql_versions,
        ) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(cluster = %self.identifier, error = %e, "could not rewrite SUPPORTED response, forwarding original");
                frame
            }
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}
