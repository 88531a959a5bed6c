//! Single-threaded event loop: drains the frame queue, classifies, tracks
//! heartbeats, dispatches registered callbacks, and normalizes execution
//! reports into the order tracker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use crate::logging::{log, obj, ts_epoch, v_num, v_str, Domain, Level};
use crate::metrics::StreamMetrics;
use crate::order::{classify, EventType, OrderUpdate, RawFrame, StreamEvent};
use crate::queue::{FrameConsumer, PollOutcome};
use crate::tracker::OrderTracker;

pub type FrameHandler = Box<dyn Fn(&StreamEvent) -> Result<()> + Send + Sync>;

/// Why the supervisor is being asked to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    TransportError,
    HeartbeatSilence,
}

/// Ordered handler lists per event type. Registration order is call order;
/// no dedup; append-only at setup time.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: HashMap<EventType, Vec<FrameHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: EventType, handler: FrameHandler) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// String-keyed registration for callers that take the event name from
    /// config. Unknown names are logged and ignored.
    pub fn register_named(&mut self, name: &str, handler: FrameHandler) {
        match EventType::parse(name) {
            Some(event_type) => self.register(event_type, handler),
            None => log(
                Level::Warn,
                Domain::Stream,
                "register_rejected",
                obj(&[("event_type", v_str(name))]),
            ),
        }
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers.get(&event_type).map_or(0, |h| h.len())
    }

    fn dispatch(&self, event_type: EventType, event: &StreamEvent, metrics: &StreamMetrics) {
        let Some(handlers) = self.handlers.get(&event_type) else {
            return;
        };
        for (idx, handler) in handlers.iter().enumerate() {
            if let Err(err) = handler(event) {
                // One faulty consumer must not take down its siblings or the loop.
                StreamMetrics::inc(&metrics.handler_errors);
                log(
                    Level::Error,
                    Domain::Stream,
                    "handler_error",
                    obj(&[
                        ("event_type", v_str(event_type.as_str())),
                        ("handler_index", v_num(idx as f64)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }
}

pub struct EventProcessor {
    consumer: FrameConsumer,
    registry: CallbackRegistry,
    tracker: Arc<Mutex<OrderTracker>>,
    last_heartbeat: Arc<AtomicU64>,
    reconnect_tx: mpsc::UnboundedSender<ReconnectReason>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<StreamMetrics>,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: FrameConsumer,
        registry: CallbackRegistry,
        tracker: Arc<Mutex<OrderTracker>>,
        last_heartbeat: Arc<AtomicU64>,
        reconnect_tx: mpsc::UnboundedSender<ReconnectReason>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            consumer,
            registry,
            tracker,
            last_heartbeat,
            reconnect_tx,
            shutdown,
            metrics,
        }
    }

    /// Cooperative loop. Exits only when the stop flag is observed; the
    /// bounded dequeue guarantees that happens within one poll interval.
    pub async fn run(mut self) {
        log(Level::Info, Domain::Stream, "processor_started", obj(&[]));
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.consumer.poll().await {
                PollOutcome::Frame(frame) => self.process(frame),
                PollOutcome::Timeout => {}
                PollOutcome::Disconnected => {
                    // Producer gone: no frame can ever arrive again.
                    log(Level::Warn, Domain::Stream, "frame_source_closed", obj(&[]));
                    break;
                }
            }
        }
        log(Level::Info, Domain::Stream, "processor_stopped", obj(&[]));
    }

    fn touch_heartbeat(&self) {
        // Single writer: this loop is the only place heartbeat state moves.
        self.last_heartbeat.store(ts_epoch(), Ordering::Relaxed);
    }

    fn process(&self, frame: RawFrame) {
        let event = classify(&frame);
        match &event {
            StreamEvent::TransportError { message } => {
                log(
                    Level::Warn,
                    Domain::Stream,
                    "transport_error_frame",
                    obj(&[("error", v_str(message))]),
                );
                let _ = self.reconnect_tx.send(ReconnectReason::TransportError);
            }
            StreamEvent::Heartbeat => {
                self.touch_heartbeat();
            }
            StreamEvent::ExecutionReport(report) => {
                self.touch_heartbeat();
                self.registry
                    .dispatch(EventType::ExecutionReport, &event, &self.metrics);
                let update = OrderUpdate::from_report(report);
                self.tracker
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply(update);
            }
            StreamEvent::AccountPosition(position) => {
                self.touch_heartbeat();
                self.registry
                    .dispatch(EventType::AccountPosition, &event, &self.metrics);
                for balance in &position.balances {
                    log(
                        Level::Info,
                        Domain::Order,
                        "balance",
                        obj(&[
                            ("asset", v_str(&balance.asset)),
                            ("free", v_num(balance.free.parse().unwrap_or(0.0))),
                            ("locked", v_num(balance.locked.parse().unwrap_or(0.0))),
                        ]),
                    );
                }
            }
            StreamEvent::BalanceUpdate(update) => {
                self.touch_heartbeat();
                self.registry
                    .dispatch(EventType::BalanceUpdate, &event, &self.metrics);
                log(
                    Level::Info,
                    Domain::Order,
                    "balance_delta",
                    obj(&[
                        ("asset", v_str(&update.asset)),
                        ("delta", v_num(update.delta.parse().unwrap_or(0.0))),
                    ]),
                );
            }
            StreamEvent::ListStatus(status) => {
                self.touch_heartbeat();
                self.registry
                    .dispatch(EventType::ListStatus, &event, &self.metrics);
                log(
                    Level::Info,
                    Domain::Order,
                    "list_status",
                    obj(&[
                        ("symbol", v_str(&status.symbol)),
                        ("list_status", v_str(&status.list_order_status)),
                    ]),
                );
            }
        }
    }
}
