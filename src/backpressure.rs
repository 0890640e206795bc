// ABOUTME: Propagates write backpressure across the three sockets of a session
// ABOUTME: A stalled write parks the session, pausing the opposite readers; stalls are timed and reported

use crate::metrics::ProxyMetrics;
use crate::upstream::UpstreamLink;
use std::future::Future;
use std::pin::pin;
use std::task::Poll;
use std::time::{Duration, Instant};

/// Couples the three write paths of a session to the opposite readers.
///
/// Each session is a single task, so while a write toward one side is in
/// flight nothing reads from the other side; that *is* the pause. What this
/// type adds is making the pause explicit: the upstream links are flagged
/// paused for the duration of a client write, and any write that does not
/// complete on its first poll (a full kernel write queue) is timed and
/// reported through the pause metrics.
pub struct BackpressureCoordinator {
    metrics: ProxyMetrics,
    client_address: String,
    wait: bool,
}

impl BackpressureCoordinator {
    pub fn new(metrics: ProxyMetrics, client_address: String, wait: bool) -> Self {
        BackpressureCoordinator {
            metrics,
            client_address,
            wait,
        }
    }

    /// Run a write toward the upstreams. The client reader is held for the
    /// duration; a stall is recorded against the client socket.
    pub async fn with_client_held<F: Future>(&self, fut: F) -> F::Output {
        let (out, stall) = stalled(fut).await;
        if let Some(elapsed) = stall {
            self.metrics
                .client_paused(&self.client_address, self.wait, elapsed);
        }
        out
    }

    /// Run a write toward the client. Both upstream receivers are paused for
    /// the duration; a stall is recorded against each upstream socket.
    pub async fn with_upstreams_held<F: Future>(
        &self,
        source: &mut UpstreamLink,
        target: &mut UpstreamLink,
        fut: F,
    ) -> F::Output {
        source.pause();
        target.pause();
        let (out, stall) = stalled(fut).await;
        source.resume();
        target.resume();
        if let Some(elapsed) = stall {
            self.metrics
                .server_paused(source.address(), source.identifier(), elapsed);
            self.metrics
                .server_paused(target.address(), target.identifier(), elapsed);
        }
        out
    }
}

/// Drive `fut` to completion, reporting how long it was parked if its first
/// poll came back pending. A write that completes immediately had room in the
/// socket's queue and is not a backpressure event.
async fn stalled<F: Future>(fut: F) -> (F::Output, Option<Duration>) {
    let mut fut = pin!(fut);
    let mut parked_at: Option<Instant> = None;
    let out = std::future::poll_fn(|cx| match fut.as_mut().poll(cx) {
        Poll::Ready(out) => Poll::Ready(out),
        Poll::Pending => {
            parked_at.get_or_insert_with(Instant::now);
            Poll::Pending
        }
    })
    .await;
    (out, parked_at.map(|t| t.elapsed()))
}
