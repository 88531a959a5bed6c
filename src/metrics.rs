use std::sync::atomic::{AtomicU64, Ordering};

use crate::logging::{json_log, obj, v_num};

/// Shared stream counters. Cheap to clone behind an `Arc`; every background
/// task gets a handle and increments without locking.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub handler_errors: AtomicU64,
    pub stale_discards: AtomicU64,
    pub regression_discards: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub reconnect_successes: AtomicU64,
    pub renewal_failures: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Emit a snapshot record to the metrics sink.
    pub fn log_snapshot(&self) {
        json_log(
            "metrics",
            obj(&[
                ("frames_received", v_num(Self::get(&self.frames_received) as f64)),
                ("frames_dropped", v_num(Self::get(&self.frames_dropped) as f64)),
                ("handler_errors", v_num(Self::get(&self.handler_errors) as f64)),
                ("stale_discards", v_num(Self::get(&self.stale_discards) as f64)),
                (
                    "regression_discards",
                    v_num(Self::get(&self.regression_discards) as f64),
                ),
                (
                    "reconnect_attempts",
                    v_num(Self::get(&self.reconnect_attempts) as f64),
                ),
                (
                    "reconnect_successes",
                    v_num(Self::get(&self.reconnect_successes) as f64),
                ),
                (
                    "renewal_failures",
                    v_num(Self::get(&self.renewal_failures) as f64),
                ),
            ]),
        );
    }
}
