//! Bounded hand-off between the transport's receive task and the event
//! processor. Single producer, single consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::metrics::StreamMetrics;
use crate::order::RawFrame;

pub fn frame_queue(
    capacity: usize,
    poll: Duration,
    metrics: Arc<StreamMetrics>,
) -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        FrameProducer { tx, metrics },
        FrameConsumer { rx, poll },
    )
}

#[derive(Clone)]
pub struct FrameProducer {
    tx: mpsc::Sender<RawFrame>,
    metrics: Arc<StreamMetrics>,
}

impl FrameProducer {
    /// Non-blocking enqueue. Overflow policy: the newest frame is dropped and
    /// counted — the receive task must never stall on a slow consumer.
    pub fn push(&self, frame: RawFrame) {
        StreamMetrics::inc(&self.metrics.frames_received);
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(frame) {
            StreamMetrics::inc(&self.metrics.frames_dropped);
            log(
                Level::Warn,
                Domain::Stream,
                "frame_dropped",
                obj(&[
                    ("reason", v_str("queue_full")),
                    (
                        "dropped_total",
                        v_num(StreamMetrics::get(&self.metrics.frames_dropped) as f64),
                    ),
                ]),
            );
        }
    }
}

/// Dequeue outcome. `Timeout` is the normal idle case; `Disconnected` means
/// the producer side is gone and no further frame can ever arrive.
#[derive(Debug)]
pub enum PollOutcome {
    Frame(RawFrame),
    Timeout,
    Disconnected,
}

pub struct FrameConsumer {
    rx: mpsc::Receiver<RawFrame>,
    poll: Duration,
}

impl FrameConsumer {
    /// Dequeue bounded by the poll timeout, so the caller can observe a
    /// shutdown signal between frames.
    pub async fn poll(&mut self) -> PollOutcome {
        match timeout(self.poll, self.rx.recv()).await {
            Ok(Some(frame)) => PollOutcome::Frame(frame),
            Ok(None) => PollOutcome::Disconnected,
            Err(_) => PollOutcome::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn empty_frame() -> RawFrame {
        RawFrame::new(Map::new())
    }

    #[tokio::test]
    async fn test_push_then_poll() {
        let metrics = Arc::new(StreamMetrics::new());
        let (tx, mut rx) = frame_queue(4, Duration::from_millis(50), metrics.clone());
        tx.push(empty_frame());
        assert!(matches!(rx.poll().await, PollOutcome::Frame(_)));
        assert_eq!(StreamMetrics::get(&metrics.frames_received), 1);
        assert_eq!(StreamMetrics::get(&metrics.frames_dropped), 0);
    }

    #[tokio::test]
    async fn test_poll_times_out_without_blocking_forever() {
        let metrics = Arc::new(StreamMetrics::new());
        let (_tx, mut rx) = frame_queue(4, Duration::from_millis(20), metrics);
        let started = std::time::Instant::now();
        assert!(matches!(rx.poll().await, PollOutcome::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_and_counts() {
        let metrics = Arc::new(StreamMetrics::new());
        let (tx, mut rx) = frame_queue(2, Duration::from_millis(20), metrics.clone());
        for _ in 0..5 {
            tx.push(empty_frame());
        }
        assert_eq!(StreamMetrics::get(&metrics.frames_received), 5);
        assert_eq!(StreamMetrics::get(&metrics.frames_dropped), 3);
        // Order preserved for the frames that fit.
        assert!(matches!(rx.poll().await, PollOutcome::Frame(_)));
        assert!(matches!(rx.poll().await, PollOutcome::Frame(_)));
        assert!(matches!(rx.poll().await, PollOutcome::Timeout));
    }

    #[tokio::test]
    async fn test_dropped_producer_reports_disconnected() {
        let metrics = Arc::new(StreamMetrics::new());
        let (tx, mut rx) = frame_queue(4, Duration::from_millis(20), metrics);
        tx.push(empty_frame());
        drop(tx);
        assert!(matches!(rx.poll().await, PollOutcome::Frame(_)));
        assert!(matches!(rx.poll().await, PollOutcome::Disconnected));
    }
}
