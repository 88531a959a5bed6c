//! Top-level user-data stream handle: wires the session, queue, processor,
//! and supervisor together and owns their task lifetimes.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::Config;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::metrics::StreamMetrics;
use crate::order::{EventType, OrderUpdate};
use crate::processor::{CallbackRegistry, EventProcessor, FrameHandler};
use crate::queue::{frame_queue, FrameConsumer};
use crate::rest::RestClient;
use crate::session::TransportSession;
use crate::supervisor::{ReconnectSupervisor, SupervisorConfig, Transport};
use crate::tracker::{ExecutionEngine, OrderTracker};

/// One user-data stream: construct, register callbacks, `start`, `stop`.
///
/// Registration is only honored before `start`; the processor owns the
/// registry once running.
pub struct UserDataStream {
    cfg: Config,
    rest: RestClient,
    session: Arc<TransportSession>,
    tracker: Arc<Mutex<OrderTracker>>,
    registry: Option<CallbackRegistry>,
    consumer: Option<FrameConsumer>,
    last_heartbeat: Arc<AtomicU64>,
    metrics: Arc<StreamMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl UserDataStream {
    pub fn new(cfg: Config, engine: Arc<dyn ExecutionEngine>) -> Self {
        let metrics = Arc::new(StreamMetrics::new());
        let (producer, consumer) = frame_queue(
            cfg.frame_queue_capacity,
            cfg.queue_poll(),
            metrics.clone(),
        );
        let rest = RestClient::new(
            cfg.rest_base.clone(),
            cfg.api_key.clone().unwrap_or_default(),
            cfg.api_secret.clone().unwrap_or_default(),
        );
        let session = Arc::new(TransportSession::new(&cfg, rest.clone(), producer));
        let tracker = Arc::new(Mutex::new(OrderTracker::new(engine, metrics.clone())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            cfg,
            rest,
            session,
            tracker,
            registry: Some(CallbackRegistry::new()),
            consumer: Some(consumer),
            last_heartbeat: Arc::new(AtomicU64::new(0)),
            metrics,
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
            running: false,
        }
    }

    pub fn register_callback(&mut self, event_type: EventType, handler: FrameHandler) {
        match self.registry.as_mut() {
            Some(registry) => registry.register(event_type, handler),
            None => log(
                Level::Warn,
                Domain::Stream,
                "register_after_start",
                obj(&[("event_type", v_str(event_type.as_str()))]),
            ),
        }
    }

    pub fn register_callback_named(&mut self, name: &str, handler: FrameHandler) {
        match self.registry.as_mut() {
            Some(registry) => registry.register_named(name, handler),
            None => log(
                Level::Warn,
                Domain::Stream,
                "register_after_start",
                obj(&[("event_type", v_str(name))]),
            ),
        }
    }

    /// Connect and launch the processor, supervisor, and renewal tasks.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        let registry = self
            .registry
            .take()
            .ok_or_else(|| anyhow!("stream already consumed"))?;
        let consumer = self
            .consumer
            .take()
            .ok_or_else(|| anyhow!("stream already consumed"))?;

        // Keeps the Auth/Transient split downcastable for callers.
        self.session.connect().await.context("initial connect")?;

        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let processor = EventProcessor::new(
            consumer,
            registry,
            self.tracker.clone(),
            self.last_heartbeat.clone(),
            reconnect_tx,
            self.shutdown_rx.clone(),
            self.metrics.clone(),
        );
        self.tasks.push(tokio::spawn(processor.run()));

        let supervisor = Arc::new(ReconnectSupervisor::new(
            self.session.clone(),
            self.last_heartbeat.clone(),
            SupervisorConfig {
                heartbeat_silence_limit: self.cfg.heartbeat_silence_limit(),
                monitor_interval: self.cfg.monitor_interval(),
                max_attempts: self.cfg.max_reconnect_attempts,
                base_delay: self.cfg.reconnect_base_delay(),
            },
            self.shutdown_tx.clone(),
            self.metrics.clone(),
        ));
        self.tasks
            .push(tokio::spawn(supervisor.run(reconnect_rx, self.shutdown_rx.clone())));

        self.tasks.push(tokio::spawn(renewal_loop(
            self.session.clone(),
            self.cfg.renewal_interval(),
            self.shutdown_rx.clone(),
            self.metrics.clone(),
        )));

        self.running = true;
        log(Level::Info, Domain::System, "stream_started", obj(&[]));
        Ok(())
    }

    /// Stop all tasks and close the session. Safe to call twice.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let _ = self.shutdown_tx.send(true);
        self.session.teardown().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.metrics.log_snapshot();
        log(Level::Info, Domain::System, "stream_stopped", obj(&[]));
    }

    /// Completes when the stream shuts itself down (reconnect exhaustion).
    pub async fn wait_closed(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Seed the tracker from the signed open-orders snapshot. Stream events
    /// that arrived first are never overwritten.
    pub async fn seed_open_orders(&self) -> Result<usize> {
        let open = self.rest.fetch_open_orders().await?;
        let count = open.len();
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        for order in &open {
            tracker.seed(order);
        }
        log(
            Level::Info,
            Domain::Order,
            "open_orders_seeded",
            obj(&[("count", v_num(count as f64))]),
        );
        Ok(count)
    }

    pub fn current_status(&self, order_id: &str) -> Option<OrderUpdate> {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_status(order_id)
    }

    pub fn order_history(&self, order_id: &str) -> Vec<OrderUpdate> {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history(order_id)
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }
}

/// Keeps the session token alive on a fixed period until shutdown. Renewal
/// failures never escalate; the socket stays up until the token actually
/// expires and the supervisor handles the disconnect.
async fn renewal_loop(
    session: Arc<dyn Transport>,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<StreamMetrics>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
        }
        if let Err(e) = session.keepalive().await {
            StreamMetrics::inc(&metrics.renewal_failures);
            log(
                Level::Warn,
                Domain::Session,
                "renewal_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectError;
    use crate::tracker::NullEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct RefusingRenewal {
        keepalives: AtomicU32,
    }

    #[async_trait]
    impl Transport for RefusingRenewal {
        async fn reconnect(&self) -> std::result::Result<(), ConnectError> {
            Ok(())
        }

        async fn teardown(&self) {}

        async fn keepalive(&self) -> Result<()> {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("renewal refused"))
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.api_key = Some("k".into());
        cfg.api_secret = Some("s".into());
        cfg
    }

    #[tokio::test]
    async fn test_registration_rejected_after_registry_taken() {
        let mut stream = UserDataStream::new(test_config(), Arc::new(NullEngine));
        stream.register_callback(EventType::ExecutionReport, Box::new(|_| Ok(())));
        // Simulate start() having consumed the registry.
        stream.registry = None;
        stream.register_callback(EventType::ExecutionReport, Box::new(|_| Ok(())));
        // No panic, no effect; stop on a never-started stream is a no-op.
        stream.stop().await;
    }

    #[tokio::test]
    async fn test_renewal_failures_count_and_never_stop_the_loop() {
        let metrics = Arc::new(StreamMetrics::new());
        let transport = Arc::new(RefusingRenewal {
            keepalives: AtomicU32::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(renewal_loop(
            transport.clone() as Arc<dyn Transport>,
            Duration::from_millis(10),
            shutdown_rx,
            metrics.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The loop survived past the first failure and kept its schedule.
        assert!(transport.keepalives.load(Ordering::SeqCst) >= 2);
        assert!(StreamMetrics::get(&metrics.renewal_failures) >= 2);

        let _ = shutdown_tx.send(true);
        let done = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(done.is_ok(), "renewal loop must observe shutdown");
    }

    #[tokio::test]
    async fn test_unknown_order_has_no_status_or_history() {
        let stream = UserDataStream::new(test_config(), Arc::new(NullEngine));
        assert!(stream.current_status("missing").is_none());
        assert!(stream.order_history("missing").is_empty());
    }
}
