// ABOUTME: Proxy error types covering connection, framing, and upstream failure modes
// ABOUTME: Provides structured error reporting with automatic conversion from I/O and TLS errors

use crate::frame::FrameError;
use std::io;
use thiserror::Error;

/// Errors raised while proxying a client connection.
///
/// Everything that can terminate a session funnels into this type so the
/// accept loop can log one structured record per connection outcome.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on any of the three sockets
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// Frame-level error on a byte stream (oversized or malformed header)
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Peer closed its socket in the middle of a frame
    #[error("connection reset by peer mid-frame")]
    TruncatedStream,

    /// Client submitted a stream id that is already in flight
    #[error("duplicate in-flight stream id {0}")]
    StreamIdCollision(i16),

    /// An upstream socket closed while requests were outstanding
    #[error("{cluster} upstream closed with {in_flight} requests in flight")]
    UpstreamClosed {
        cluster: &'static str,
        in_flight: usize,
    },

    /// TLS configuration or handshake failure
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Upstream host is not a valid TLS server name
    #[error("invalid upstream server name: {0}")]
    ServerName(String),

    /// Listener or TLS credential configuration is unusable
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A specialized `Result` type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
