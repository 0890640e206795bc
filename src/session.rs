// ABOUTME: Per-connection orchestration: request fan-out, stream-id join, response selection
// ABOUTME: A single task owns all three sockets; in-flight requests live in a dense table

use crate::backpressure::BackpressureCoordinator;
use crate::config::ProxyConfig;
use crate::connection::Connection;
use crate::error::ProxyError;
use crate::frame::{Frame, FrameKind};
use crate::guard::ProtocolGuard;
use crate::metrics::ProxyMetrics;
use crate::rewrite::QueryRewriter;
use crate::upstream::UpstreamLink;
use std::time::Instant;
use tracing::{debug, warn};

/// One in-flight request: created when the client frame arrives, filled in by
/// the two upstreams, destroyed once both answered and the chosen response
/// went out.
struct PendingRequest {
    opcode: u8,
    kind: FrameKind,
    start: Instant,
    source: Option<Frame>,
    target: Option<Frame>,
    forwarded: bool,
}

/// Stream-id indexed table of in-flight requests.
///
/// A dense array rather than a map: stream ids are 16-bit and allocated from
/// zero by every driver, so the table stays small for synchronous clients and
/// tops out at 64 Ki slots. Lookup on the response path is a plain index.
struct PendingTable {
    slots: Vec<Option<PendingRequest>>,
    in_flight: usize,
}

impl PendingTable {
    fn new() -> PendingTable {
        PendingTable {
            slots: Vec::new(),
            in_flight: 0,
        }
    }

    fn index(stream: i16) -> usize {
        stream as u16 as usize
    }

    fn insert(&mut self, stream: i16, request: PendingRequest) -> Result<(), ProxyError> {
        let index = Self::index(stream);
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Err(ProxyError::StreamIdCollision(stream));
        }
        *slot = Some(request);
        self.in_flight += 1;
        Ok(())
    }

    fn get_mut(&mut self, stream: i16) -> Option<&mut PendingRequest> {
        self.slots.get_mut(Self::index(stream))?.as_mut()
    }

    /// Remove and return the entry once both slots are filled.
    fn take_if_complete(&mut self, stream: i16) -> Option<PendingRequest> {
        let slot = self.slots.get_mut(Self::index(stream))?;
        if slot
            .as_ref()
            .is_some_and(|r| r.source.is_some() && r.target.is_some())
        {
            self.in_flight -= 1;
            return slot.take();
        }
        None
    }

    fn len(&self) -> usize {
        self.in_flight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cluster {
    Source,
    Target,
}

impl Cluster {
    fn as_str(self) -> &'static str {
        match self {
            Cluster::Source => "source",
            Cluster::Target => "target",
        }
    }
}

enum Event {
    Client(Option<Frame>),
    Upstream(Cluster, Option<Frame>),
}

/// The per-client-connection pipeline.
///
/// Every client frame is classified, optionally guarded and rewritten, then
/// fanned out to both clusters (source first). Responses are matched back by
/// stream id; the source response is what the client sees, the target
/// response is compared and dropped. With `wait` set, the source response is
/// held until the target has also answered.
pub struct Session {
    client: Connection,
    client_address: String,
    source: UpstreamLink,
    target: UpstreamLink,
    pending: PendingTable,
    guard: ProtocolGuard,
    rewriter: Option<QueryRewriter>,
    backpressure: BackpressureCoordinator,
    metrics: ProxyMetrics,
    wait: bool,
}

impl Session {
    pub fn new(
        client: Connection,
        client_address: String,
        source: UpstreamLink,
        target: UpstreamLink,
        config: &ProxyConfig,
        metrics: ProxyMetrics,
    ) -> Session {
        Session {
            backpressure: BackpressureCoordinator::new(
                metrics.clone(),
                client_address.clone(),
                config.wait,
            ),
            guard: ProtocolGuard::new(config.protocol_versions.clone()),
            rewriter: config.uuid.then(QueryRewriter::new),
            wait: config.wait,
            pending: PendingTable::new(),
            client,
            client_address,
            source,
            target,
            metrics,
        }
    }

    /// Drive the connection until the client goes away or something fails.
    /// In-flight requests at teardown are abandoned; the closed client socket
    /// is their cancellation.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let outcome = self.drive().await;
        if self.pending.len() > 0 {
            warn!(
                client = %self.client_address,
                in_flight = self.pending.len(),
                "closing connection with requests in flight"
            );
        }
        outcome
    }

    async fn drive(&mut self) -> Result<(), ProxyError> {
        loop {
            let source_paused = self.source.is_paused();
            let target_paused = self.target.is_paused();
            let event = tokio::select! {
                res = self.client.read_frame() => Event::Client(res?),
                res = self.source.read_frame(), if !source_paused => {
                    Event::Upstream(Cluster::Source, res?)
                }
                res = self.target.read_frame(), if !target_paused => {
                    Event::Upstream(Cluster::Target, res?)
                }
            };
            match event {
                Event::Client(None) => {
                    debug!(client = %self.client_address, "client disconnected");
                    return Ok(());
                }
                Event::Client(Some(frame)) => self.handle_request(frame).await?,
                Event::Upstream(cluster, None) => {
                    return Err(ProxyError::UpstreamClosed {
                        cluster: cluster.as_str(),
                        in_flight: self.pending.len(),
                    });
                }
                Event::Upstream(cluster, Some(frame)) => {
                    self.handle_response(cluster, frame).await?
                }
            }
        }
    }

    async fn handle_request(&mut self, frame: Frame) -> Result<(), ProxyError> {
        let start = Instant::now();
        let opcode = frame.header.opcode;
        let kind = frame.kind();

        if let Some(rejection) = self.guard.admit(&frame) {
            warn!(
                client = %self.client_address,
                version = frame.header.protocol_version(),
                "rejecting unsupported protocol version"
            );
            return self.write_client(&rejection).await;
        }

        let frame = match &self.rewriter {
            Some(rewriter) => rewriter.rewrite(&frame).unwrap_or(frame),
            None => frame,
        };

        self.pending.insert(
            frame.stream(),
            PendingRequest {
                opcode,
                kind,
                start,
                source: None,
                target: None,
                forwarded: false,
            },
        )?;

        let source = &mut self.source;
        let target = &mut self.target;
        let fan_out = async move {
            source.queue(&frame).await?;
            target.queue(&frame).await?;
            source.flush().await?;
            target.flush().await
        };
        self.backpressure.with_client_held(fan_out).await?;

        self.metrics.proxy_time(opcode, kind, start.elapsed());
        Ok(())
    }

    async fn handle_response(&mut self, cluster: Cluster, frame: Frame) -> Result<(), ProxyError> {
        let frame = match cluster {
            Cluster::Source => self.source.filter_response(frame),
            Cluster::Target => frame,
        };

        // Server-pushed events carry no request to correlate with; the
        // source's go to the client, the target's mirror copy is dropped.
        if frame.kind() == FrameKind::Event {
            return match cluster {
                Cluster::Source => self.write_client(&frame).await,
                Cluster::Target => Ok(()),
            };
        }

        let stream = frame.stream();
        let Some(entry) = self.pending.get_mut(stream) else {
            debug!(
                cluster = cluster.as_str(),
                stream, "response for unknown stream id, dropping"
            );
            return Ok(());
        };

        let forward_now = match cluster {
            Cluster::Source => {
                entry.source = Some(frame);
                !self.wait && !entry.forwarded
            }
            Cluster::Target => {
                entry.target = Some(frame);
                false
            }
        };

        if forward_now {
            entry.forwarded = true;
            let response = entry.source.clone();
            if let Some(response) = response {
                self.write_client(&response).await?;
            }
        }

        if let Some(done) = self.pending.take_if_complete(stream) {
            self.finish(done).await?;
        }
        Ok(())
    }

    /// Both upstreams have answered: emit metrics and, in `wait` mode, send
    /// the source response onward.
    async fn finish(&mut self, done: PendingRequest) -> Result<(), ProxyError> {
        self.metrics
            .request_time(done.opcode, done.kind, done.start.elapsed());

        if let (Some(source), Some(target)) = (&done.source, &done.target) {
            if source.kind() == FrameKind::Error {
                self.metrics.server_error(done.opcode, done.kind);
            }
            if source.bytes() != target.bytes() {
                debug!(
                    stream = source.stream(),
                    source_len = source.bytes().len(),
                    target_len = target.bytes().len(),
                    "source and target responses differ"
                );
                self.metrics.different_result(done.opcode, done.kind);
            }
        }

        if self.wait && !done.forwarded {
            if let Some(response) = &done.source {
                self.write_client(response).await?;
            }
        }
        Ok(())
    }

    async fn write_client(&mut self, frame: &Frame) -> Result<(), ProxyError> {
        let write = self.client.write_frame(frame);
        self.backpressure
            .with_upstreams_held(&mut self.source, &mut self.target, write)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, Opcode};

    fn request() -> PendingRequest {
        PendingRequest {
            opcode: Opcode::Query as u8,
            kind: FrameKind::Query,
            start: Instant::now(),
            source: None,
            target: None,
            forwarded: false,
        }
    }

    fn response(stream: i16) -> Frame {
        let header = FrameHeader {
            version: 0x84,
            flags: 0,
            stream,
            opcode: Opcode::Result as u8,
            body_len: 0,
        };
        Frame::from_parts(header, b"ok")
    }

    #[test]
    fn insert_and_complete() {
        let mut table = PendingTable::new();
        table.insert(1, request()).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.take_if_complete(1).is_none());

        table.get_mut(1).unwrap().source = Some(response(1));
        assert!(table.take_if_complete(1).is_none());
        table.get_mut(1).unwrap().target = Some(response(1));
        assert!(table.take_if_complete(1).is_some());
        assert_eq!(table.len(), 0);
        assert!(table.get_mut(1).is_none());
    }

    #[test]
    fn duplicate_stream_id_is_rejected() {
        let mut table = PendingTable::new();
        table.insert(7, request()).unwrap();
        assert!(matches!(
            table.insert(7, request()),
            Err(ProxyError::StreamIdCollision(7))
        ));
    }

    #[test]
    fn stream_id_can_be_reused_after_completion() {
        let mut table = PendingTable::new();
        table.insert(7, request()).unwrap();
        table.get_mut(7).unwrap().source = Some(response(7));
        table.get_mut(7).unwrap().target = Some(response(7));
        table.take_if_complete(7).unwrap();
        table.insert(7, request()).unwrap();
    }

    #[test]
    fn negative_stream_ids_index_without_overlap() {
        let mut table = PendingTable::new();
        table.insert(-1, request()).unwrap();
        table.insert(1, request()).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.get_mut(-1).is_some());
        assert!(table.get_mut(1).is_some());
    }

    #[test]
    fn table_grows_to_highest_stream_id_only() {
        let mut table = PendingTable::new();
        table.insert(0, request()).unwrap();
        assert_eq!(table.slots.len(), 1);
        table.insert(128, request()).unwrap();
        assert_eq!(table.slots.len(), 129);
    }
}
