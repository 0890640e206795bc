// ABOUTME: Metric emission handle threaded through the per-connection pipeline
// ABOUTME: Thin gated wrapper over the `metrics` facade; the exporter is wired up elsewhere

use crate::frame::FrameKind;
use metrics::{counter, histogram};
use std::time::Duration;

const PROXY_TIME: &str = "cassandraProxy.cqlOperation.proxyTime";
const REQUEST_TIME: &str = "cassandraProxy.cqlOperation.timer";
const SERVER_ERROR_COUNT: &str = "cassandraProxy.cqlOperation.cqlServerErrorCount";
const DIFFERENT_RESULT_COUNT: &str = "cassandraProxy.cqlOperation.cqlDifferentResultCount";
const CLIENT_PAUSED: &str = "cassandraProxy.clientSocket.paused";
const SERVER_PAUSED: &str = "cassandraProxy.serverSocket.paused";

/// Handle for everything the proxy measures.
///
/// Constructed once per server from the `metrics` config flag and cloned into
/// each session; when disabled every call is a no-op so the hot path pays a
/// single branch. The actual registry/exporter behind the facade is the
/// embedding application's concern.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    enabled: bool,
}

impl ProxyMetrics {
    pub fn new(enabled: bool) -> ProxyMetrics {
        ProxyMetrics { enabled }
    }

    pub fn disabled() -> ProxyMetrics {
        ProxyMetrics { enabled: false }
    }

    /// Time spent on local processing of a request, up to the fan-out return.
    pub fn proxy_time(&self, opcode: u8, kind: FrameKind, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        histogram!(PROXY_TIME, "opcode" => opcode_label(opcode), "state" => kind.as_str())
            .record(elapsed.as_secs_f64());
    }

    /// End-to-end latency of one request, client frame in to response out.
    pub fn request_time(&self, opcode: u8, kind: FrameKind, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        histogram!(REQUEST_TIME, "opcode" => opcode_label(opcode), "state" => kind.as_str())
            .record(elapsed.as_secs_f64());
    }

    /// The authoritative response was an ERROR frame.
    pub fn server_error(&self, opcode: u8, kind: FrameKind) {
        if !self.enabled {
            return;
        }
        counter!(SERVER_ERROR_COUNT, "opcode" => opcode_label(opcode), "state" => kind.as_str())
            .increment(1);
    }

    /// Source and target returned different bytes for the same request.
    pub fn different_result(&self, opcode: u8, kind: FrameKind) {
        if !self.enabled {
            return;
        }
        counter!(DIFFERENT_RESULT_COUNT, "opcode" => opcode_label(opcode), "state" => kind.as_str())
            .increment(1);
    }

    /// Duration the client reader was held because an upstream write stalled.
    pub fn client_paused(&self, client_address: &str, wait: bool, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        histogram!(
            CLIENT_PAUSED,
            "clientAddress" => client_address.to_string(),
            "wait" => if wait { "true" } else { "false" }
        )
        .record(elapsed.as_secs_f64());
    }

    /// Duration an upstream receiver was held because the client write
    /// stalled.
    pub fn server_paused(&self, server_address: &str, identifier: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        histogram!(
            SERVER_PAUSED,
            "serverAddress" => server_address.to_string(),
            "serverIdentifier" => identifier.to_string()
        )
        .record(elapsed.as_secs_f64());
    }
}

fn opcode_label(opcode: u8) -> String {
    format!("{opcode:#04x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_labels_are_hex() {
        assert_eq!(opcode_label(0x07), "0x07");
        assert_eq!(opcode_label(0x0d), "0x0d");
        assert_eq!(opcode_label(0x10), "0x10");
    }

    #[test]
    fn disabled_handle_is_inert() {
        // Must not panic without an installed recorder.
        let metrics = ProxyMetrics::disabled();
        metrics.proxy_time(0x07, FrameKind::Query, Duration::from_millis(1));
        metrics.different_result(0x07, FrameKind::Query);
        metrics.client_paused("127.0.0.1:1", true, Duration::from_millis(1));
    }
}
