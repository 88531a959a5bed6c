//! Order state tracker: current state and full history per order, with
//! redelivery safety (stale/duplicate discard, terminal no-regression) and
//! fire-and-forget forwarding to the execution engine collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::metrics::StreamMetrics;
use crate::order::{OrderStatus, OrderUpdate, Side};
use crate::rest::OpenOrder;

/// Downstream consumer of accepted updates. Expected to be idempotent:
/// redelivery safety holds within this process, not across restarts.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn update_order_from_stream(&self, order_id: &str, update: &OrderUpdate) -> Result<()>;
}

/// Stand-in engine for runs without a wired collaborator. Logs and succeeds.
pub struct NullEngine;

#[async_trait]
impl ExecutionEngine for NullEngine {
    async fn update_order_from_stream(&self, order_id: &str, update: &OrderUpdate) -> Result<()> {
        log(
            Level::Debug,
            Domain::Order,
            "engine_stub",
            obj(&[
                ("order_id", v_str(order_id)),
                ("status", v_str(update.status.as_str())),
            ]),
        );
        Ok(())
    }
}

/// Outcome of applying one normalized update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Timestamp older than the stored entry: redelivered or out of order.
    DiscardedStale,
    /// Would move a terminal order back to a non-terminal status.
    DiscardedRegression,
}

pub struct OrderTracker {
    orders: HashMap<String, OrderUpdate>,
    history: HashMap<String, Vec<OrderUpdate>>,
    engine: Arc<dyn ExecutionEngine>,
    metrics: Arc<StreamMetrics>,
}

impl OrderTracker {
    pub fn new(engine: Arc<dyn ExecutionEngine>, metrics: Arc<StreamMetrics>) -> Self {
        Self {
            orders: HashMap::new(),
            history: HashMap::new(),
            engine,
            metrics,
        }
    }

    /// Apply one normalized update. Single writer: only the event processor's
    /// thread of control calls this.
    pub fn apply(&mut self, mut update: OrderUpdate) -> ApplyOutcome {
        update.remaining_qty = (update.qty - update.filled_qty).max(0.0);

        if let Some(current) = self.orders.get(&update.order_id) {
            if update.ts < current.ts {
                StreamMetrics::inc(&self.metrics.stale_discards);
                log(
                    Level::Debug,
                    Domain::Order,
                    "stale_discard",
                    obj(&[
                        ("order_id", v_str(&update.order_id)),
                        ("stored_ts", v_num(current.ts as f64)),
                        ("frame_ts", v_num(update.ts as f64)),
                    ]),
                );
                return ApplyOutcome::DiscardedStale;
            }
            // Terminal means final: a filled order cannot become canceled any
            // more than it can reopen. Redeliveries of the same terminal
            // status still pass the gate.
            if current.status.is_terminal() && update.status != current.status {
                StreamMetrics::inc(&self.metrics.regression_discards);
                log(
                    Level::Warn,
                    Domain::Order,
                    "regression_discard",
                    obj(&[
                        ("order_id", v_str(&update.order_id)),
                        ("stored_status", v_str(current.status.as_str())),
                        ("frame_status", v_str(update.status.as_str())),
                    ]),
                );
                return ApplyOutcome::DiscardedRegression;
            }
            // Carry the cumulative fill sequence forward.
            update.fills = current.fills.clone();
        }

        // A fill record is appended only when the accepted update lands in
        // partially_filled/filled with a non-zero last-fill quantity.
        if matches!(
            update.status,
            OrderStatus::PartiallyFilled | OrderStatus::Filled
        ) {
            if let Some(fill) = update.last_fill {
                if fill.qty > 0.0 {
                    update.fills.push(fill);
                }
            }
        }

        log(
            Level::Info,
            Domain::Order,
            "order_update",
            obj(&[
                ("order_id", v_str(&update.order_id)),
                ("status", v_str(update.status.as_str())),
                ("filled_qty", v_num(update.filled_qty)),
                ("remaining_qty", v_num(update.remaining_qty)),
            ]),
        );

        self.history
            .entry(update.order_id.clone())
            .or_default()
            .push(update.clone());
        self.forward(update.clone());
        self.orders.insert(update.order_id.clone(), update);
        ApplyOutcome::Applied
    }

    /// Fire-and-forget forward to the engine: its own task, its own error
    /// boundary, off the tracker's critical path.
    fn forward(&self, update: OrderUpdate) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(err) = engine
                .update_order_from_stream(&update.order_id, &update)
                .await
            {
                log(
                    Level::Error,
                    Domain::Order,
                    "engine_forward_failed",
                    obj(&[
                        ("order_id", v_str(&update.order_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        });
    }

    /// Seed an order from the REST snapshot. Never overwrites state already
    /// derived from the stream.
    pub fn seed(&mut self, open: &OpenOrder) {
        if self.orders.contains_key(&open.order_id) {
            return;
        }
        let qty = open.orig_qty;
        let filled = open.executed_qty;
        let update = OrderUpdate {
            order_id: open.order_id.clone(),
            client_order_id: if open.client_order_id.is_empty() {
                None
            } else {
                Some(open.client_order_id.clone())
            },
            symbol: open.symbol.clone(),
            side: if open.side == "BUY" {
                Side::Buy
            } else {
                Side::Sell
            },
            order_type: open.order_type.clone(),
            status: OrderStatus::from_wire(&open.status),
            price: open.price,
            qty,
            filled_qty: filled,
            remaining_qty: (qty - filled).max(0.0),
            ts: open.update_time,
            is_maker: false,
            is_reduce_only: false,
            last_fill: None,
            fills: Vec::new(),
        };
        log(
            Level::Info,
            Domain::Order,
            "order_seeded",
            obj(&[
                ("order_id", v_str(&update.order_id)),
                ("status", v_str(update.status.as_str())),
            ]),
        );
        self.history
            .entry(update.order_id.clone())
            .or_default()
            .push(update.clone());
        self.orders.insert(update.order_id.clone(), update);
    }

    pub fn current_status(&self, order_id: &str) -> Option<OrderUpdate> {
        self.orders.get(order_id).cloned()
    }

    pub fn history(&self, order_id: &str) -> Vec<OrderUpdate> {
        self.history.get(order_id).cloned().unwrap_or_default()
    }

    pub fn tracked_count(&self) -> usize {
        self.orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::FillRecord;
    use std::sync::Mutex;

    /// Engine that records every forwarded update.
    pub struct RecordingEngine {
        pub calls: Mutex<Vec<(String, OrderStatus)>>,
    }

    impl RecordingEngine {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExecutionEngine for RecordingEngine {
        async fn update_order_from_stream(
            &self,
            order_id: &str,
            update: &OrderUpdate,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((order_id.to_string(), update.status));
            Ok(())
        }
    }

    fn update(
        order_id: &str,
        status: OrderStatus,
        ts: u64,
        qty: f64,
        filled: f64,
        last_fill_qty: f64,
    ) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.to_string(),
            client_order_id: Some(format!("c-{}", order_id)),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: "LIMIT".to_string(),
            status,
            price: 50_000.0,
            qty,
            filled_qty: filled,
            remaining_qty: qty - filled,
            ts,
            is_maker: false,
            is_reduce_only: false,
            last_fill: if last_fill_qty > 0.0 {
                Some(FillRecord {
                    price: 50_000.0,
                    qty: last_fill_qty,
                    ts,
                })
            } else {
                None
            },
            fills: Vec::new(),
        }
    }

    fn tracker() -> (OrderTracker, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::new());
        let t = OrderTracker::new(engine.clone(), Arc::new(StreamMetrics::new()));
        (t, engine)
    }

    #[tokio::test]
    async fn test_lifecycle_scenario_new_partial_filled() {
        let (mut t, _engine) = tracker();
        assert_eq!(
            t.apply(update("123", OrderStatus::Open, 100, 1.0, 0.0, 0.0)),
            ApplyOutcome::Applied
        );
        assert_eq!(
            t.apply(update("123", OrderStatus::PartiallyFilled, 200, 1.0, 0.4, 0.4)),
            ApplyOutcome::Applied
        );
        assert_eq!(
            t.apply(update("123", OrderStatus::Filled, 300, 1.0, 1.0, 0.6)),
            ApplyOutcome::Applied
        );

        let current = t.current_status("123").unwrap();
        assert_eq!(current.status, OrderStatus::Filled);
        assert_eq!(current.remaining_qty, 0.0);
        assert_eq!(current.fills.len(), 2);
        assert_eq!(t.history("123").len(), 3);
    }

    #[tokio::test]
    async fn test_stale_frame_discarded() {
        let (mut t, _engine) = tracker();
        t.apply(update("9", OrderStatus::PartiallyFilled, 200, 1.0, 0.5, 0.5));
        let outcome = t.apply(update("9", OrderStatus::Open, 100, 1.0, 0.0, 0.0));
        assert_eq!(outcome, ApplyOutcome::DiscardedStale);
        assert_eq!(t.current_status("9").unwrap().status, OrderStatus::PartiallyFilled);
        assert_eq!(t.history("9").len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_no_regression() {
        let (mut t, _engine) = tracker();
        t.apply(update("7", OrderStatus::Canceled, 100, 1.0, 0.0, 0.0));
        // Later timestamp, but terminal → non-terminal is still refused.
        let outcome = t.apply(update("7", OrderStatus::Open, 200, 1.0, 0.0, 0.0));
        assert_eq!(outcome, ApplyOutcome::DiscardedRegression);
        assert_eq!(t.current_status("7").unwrap().status, OrderStatus::Canceled);
        assert_eq!(t.history("7").len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_to_other_terminal_refused() {
        let (mut t, _engine) = tracker();
        t.apply(update("6", OrderStatus::Filled, 100, 1.0, 1.0, 1.0));
        // A cancel cannot land on a fully filled order, even with a later ts.
        let outcome = t.apply(update("6", OrderStatus::Canceled, 200, 1.0, 1.0, 0.0));
        assert_eq!(outcome, ApplyOutcome::DiscardedRegression);
        assert_eq!(t.current_status("6").unwrap().status, OrderStatus::Filled);
        assert_eq!(t.history("6").len(), 1);
    }

    #[tokio::test]
    async fn test_equal_timestamp_accepted() {
        let (mut t, _engine) = tracker();
        t.apply(update("5", OrderStatus::Open, 100, 1.0, 0.0, 0.0));
        let outcome = t.apply(update("5", OrderStatus::PartiallyFilled, 100, 1.0, 0.2, 0.2));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(t.history("5").len(), 2);
    }

    #[tokio::test]
    async fn test_remaining_qty_recomputed() {
        let (mut t, _engine) = tracker();
        let mut u = update("3", OrderStatus::PartiallyFilled, 100, 2.0, 0.5, 0.5);
        u.remaining_qty = 99.0; // wrong on purpose; apply must recompute
        t.apply(u);
        let current = t.current_status("3").unwrap();
        assert!((current.remaining_qty - 1.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_forward_reaches_engine() {
        let (mut t, engine) = tracker();
        t.apply(update("42", OrderStatus::Open, 100, 1.0, 0.0, 0.0));
        // The forward is a spawned task; give it a tick.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("42".to_string(), OrderStatus::Open));
    }

    #[tokio::test]
    async fn test_discards_are_not_forwarded() {
        let (mut t, engine) = tracker();
        t.apply(update("8", OrderStatus::Filled, 200, 1.0, 1.0, 1.0));
        t.apply(update("8", OrderStatus::Open, 100, 1.0, 0.0, 0.0));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(engine.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seed_does_not_overwrite_stream_state() {
        let (mut t, _engine) = tracker();
        t.apply(update("11", OrderStatus::PartiallyFilled, 500, 1.0, 0.5, 0.5));
        t.seed(&OpenOrder {
            order_id: "11".to_string(),
            client_order_id: "c-11".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            order_type: "LIMIT".to_string(),
            price: 50_000.0,
            orig_qty: 1.0,
            executed_qty: 0.0,
            status: "NEW".to_string(),
            update_time: 400,
        });
        assert_eq!(t.current_status("11").unwrap().status, OrderStatus::PartiallyFilled);
        assert_eq!(t.history("11").len(), 1);
    }
}
