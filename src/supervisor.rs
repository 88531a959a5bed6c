//! Liveness monitoring and bounded-retry reconnection.
//!
//! Runs independently of the event processor so a stuck loop cannot block
//! detection, and a slow reconnect cannot block the monitor's other checks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::error::ConnectError;
use crate::logging::{log, obj, ts_epoch, v_num, v_str, Domain, Level};
use crate::metrics::StreamMetrics;
use crate::processor::ReconnectReason;

/// The transport operations background tasks drive. Seam for tests; the
/// live implementation is `TransportSession`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Full re-authentication and reconnection.
    async fn reconnect(&self) -> Result<(), ConnectError>;
    /// Best-effort teardown of the current handle; errors are swallowed.
    async fn teardown(&self);
    /// Periodic session-token renewal. No-op for transports without a
    /// renewable token.
    async fn keepalive(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Connected,
    Reconnecting,
    Failed,
}

pub struct SupervisorConfig {
    pub heartbeat_silence_limit: Duration,
    pub monitor_interval: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

pub struct ReconnectSupervisor {
    transport: Arc<dyn Transport>,
    state: Mutex<ReconnectState>,
    last_heartbeat: Arc<AtomicU64>,
    cfg: SupervisorConfig,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<StreamMetrics>,
}

impl ReconnectSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        last_heartbeat: Arc<AtomicU64>,
        cfg: SupervisorConfig,
        shutdown_tx: watch::Sender<bool>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            transport,
            state: Mutex::new(ReconnectState::Connected),
            last_heartbeat,
            cfg,
            shutdown_tx,
            metrics,
        }
    }

    pub fn state(&self) -> ReconnectState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Monitor loop: wakes on the check interval or an explicit trigger from
    /// the event processor, and evaluates liveness.
    pub async fn run(
        self: Arc<Self>,
        mut trigger_rx: mpsc::UnboundedReceiver<ReconnectReason>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        // Start the silence clock at monitor launch, so a connection that
        // never delivers a single frame is still caught.
        if self.last_heartbeat.load(Ordering::Relaxed) == 0 {
            self.last_heartbeat.store(ts_epoch(), Ordering::Relaxed);
        }
        log(Level::Info, Domain::Supervisor, "monitor_started", obj(&[]));
        loop {
            let reason = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                trigger = trigger_rx.recv() => match trigger {
                    Some(reason) => Some(reason),
                    None => break,
                },
                _ = sleep(self.cfg.monitor_interval) => {
                    if self.heartbeat_silent() {
                        Some(ReconnectReason::HeartbeatSilence)
                    } else {
                        None
                    }
                }
            };

            if *shutdown_rx.borrow() {
                break;
            }
            if let Some(reason) = reason {
                self.handle_outage(reason, &mut shutdown_rx).await;
            }
            if self.state() == ReconnectState::Failed {
                break;
            }
        }
        log(Level::Info, Domain::Supervisor, "monitor_stopped", obj(&[]));
    }

    fn heartbeat_silent(&self) -> bool {
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        if last == 0 {
            // Clock not seeded yet; `run` seeds it before the first check.
            return false;
        }
        let silence = ts_epoch().saturating_sub(last);
        silence > self.cfg.heartbeat_silence_limit.as_secs()
    }

    /// Drive one outage to resolution: reconnected, shut down, or Failed.
    /// Re-entrancy guard: a second trigger while Reconnecting is a no-op.
    pub async fn handle_outage(
        &self,
        reason: ReconnectReason,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ReconnectState::Reconnecting | ReconnectState::Failed => return,
                ReconnectState::Connected => *state = ReconnectState::Reconnecting,
            }
        }
        log(
            Level::Warn,
            Domain::Supervisor,
            "reconnecting",
            obj(&[("reason", v_str(&format!("{:?}", reason)))]),
        );

        for attempt in 1..=self.cfg.max_attempts {
            StreamMetrics::inc(&self.metrics.reconnect_attempts);
            self.transport.teardown().await;

            // Linear backoff, scaled by attempt count.
            let delay = self.cfg.base_delay * attempt;
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }

            match self.transport.reconnect().await {
                Ok(()) => {
                    StreamMetrics::inc(&self.metrics.reconnect_successes);
                    // Fresh connection: restart the silence clock.
                    self.last_heartbeat.store(ts_epoch(), Ordering::Relaxed);
                    *self.state.lock().unwrap_or_else(|e| e.into_inner()) =
                        ReconnectState::Connected;
                    log(
                        Level::Info,
                        Domain::Supervisor,
                        "reconnected",
                        obj(&[("attempt", v_num(attempt as f64))]),
                    );
                    return;
                }
                Err(err) if !err.is_retryable() => {
                    // Credentials rejected: retrying cannot help.
                    *self.state.lock().unwrap_or_else(|e| e.into_inner()) =
                        ReconnectState::Failed;
                    log(
                        Level::Fatal,
                        Domain::Supervisor,
                        "auth_rejected",
                        obj(&[
                            ("attempt", v_num(attempt as f64)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    self.transport.teardown().await;
                    let _ = self.shutdown_tx.send(true);
                    return;
                }
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Supervisor,
                        "reconnect_failed",
                        obj(&[
                            ("attempt", v_num(attempt as f64)),
                            ("max_attempts", v_num(self.cfg.max_attempts as f64)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }

        // Ceiling reached: terminal failure, stop the whole session.
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ReconnectState::Failed;
        log(
            Level::Fatal,
            Domain::Supervisor,
            "reconnect_exhausted",
            obj(&[("attempts", v_num(self.cfg.max_attempts as f64))]),
        );
        self.transport.teardown().await;
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct ScriptedTransport {
        reconnect_calls: AtomicU32,
        teardown_calls: AtomicU32,
        /// Succeed on the Nth reconnect call (0 = never).
        succeed_on: u32,
        auth_reject: bool,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn failing() -> Self {
            Self {
                reconnect_calls: AtomicU32::new(0),
                teardown_calls: AtomicU32::new(0),
                succeed_on: 0,
                auth_reject: false,
                delay: Duration::ZERO,
            }
        }

        fn succeeding_on(n: u32) -> Self {
            Self {
                reconnect_calls: AtomicU32::new(0),
                teardown_calls: AtomicU32::new(0),
                succeed_on: n,
                auth_reject: false,
                delay: Duration::ZERO,
            }
        }

        fn auth_rejecting() -> Self {
            Self {
                auth_reject: true,
                ..Self::failing()
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn reconnect(&self) -> Result<(), ConnectError> {
            let call = self.reconnect_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.delay > Duration::ZERO {
                sleep(self.delay).await;
            }
            if self.auth_reject {
                Err(ConnectError::Auth("scripted credential rejection".into()))
            } else if self.succeed_on != 0 && call >= self.succeed_on {
                Ok(())
            } else {
                Err(ConnectError::Transient("scripted failure".into()))
            }
        }

        async fn teardown(&self) {
            self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supervisor(
        transport: Arc<ScriptedTransport>,
        heartbeat: Arc<AtomicU64>,
        monitor_interval: Duration,
    ) -> (Arc<ReconnectSupervisor>, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sup = Arc::new(ReconnectSupervisor::new(
            transport,
            heartbeat,
            SupervisorConfig {
                heartbeat_silence_limit: Duration::from_secs(60),
                monitor_interval,
                max_attempts: 5,
                base_delay: Duration::ZERO,
            },
            shutdown_tx,
            metrics(),
        ));
        (sup, shutdown_rx)
    }

    fn metrics() -> Arc<StreamMetrics> {
        Arc::new(StreamMetrics::new())
    }

    #[tokio::test]
    async fn test_exhaustion_after_ceiling_then_failed_and_stop() {
        let transport = Arc::new(ScriptedTransport::failing());
        let heartbeat = Arc::new(AtomicU64::new(ts_epoch()));
        let (sup, mut shutdown_rx) = supervisor(transport.clone(), heartbeat, Duration::from_secs(30));

        sup.handle_outage(ReconnectReason::TransportError, &mut shutdown_rx)
            .await;

        assert_eq!(sup.state(), ReconnectState::Failed);
        assert_eq!(transport.reconnect_calls.load(Ordering::SeqCst), 5);
        // One teardown per attempt plus the final one on giving up.
        assert_eq!(transport.teardown_calls.load(Ordering::SeqCst), 6);
        assert!(*shutdown_rx.borrow(), "failed supervisor must stop the session");

        // A sixth trigger does not reconnect again.
        sup.handle_outage(ReconnectReason::TransportError, &mut shutdown_rx)
            .await;
        assert_eq!(transport.reconnect_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_success_resets_to_connected() {
        let transport = Arc::new(ScriptedTransport::succeeding_on(3));
        let heartbeat = Arc::new(AtomicU64::new(ts_epoch()));
        let (sup, mut shutdown_rx) = supervisor(transport.clone(), heartbeat, Duration::from_secs(30));

        sup.handle_outage(ReconnectReason::TransportError, &mut shutdown_rx)
            .await;

        assert_eq!(sup.state(), ReconnectState::Connected);
        assert_eq!(transport.reconnect_calls.load(Ordering::SeqCst), 3);
        assert!(!*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_heartbeat_silence_detected_within_one_monitor_interval() {
        let transport = Arc::new(ScriptedTransport::succeeding_on(1));
        // Heartbeat 120s in the past, limit is 60s.
        let heartbeat = Arc::new(AtomicU64::new(ts_epoch().saturating_sub(120)));
        let (sup, _shutdown_rx) =
            supervisor(transport.clone(), heartbeat, Duration::from_millis(50));

        let (_trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.clone().run(trigger_rx, stop_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(transport.reconnect_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(sup.state(), ReconnectState::Connected);
        task.abort();
    }

    #[tokio::test]
    async fn test_no_reentry_while_reconnecting() {
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(100),
            ..ScriptedTransport::succeeding_on(1)
        });
        let heartbeat = Arc::new(AtomicU64::new(ts_epoch()));
        let (sup, shutdown_rx) = supervisor(transport.clone(), heartbeat, Duration::from_secs(30));

        let sup_a = sup.clone();
        let mut rx_a = shutdown_rx.clone();
        let first = tokio::spawn(async move {
            sup_a
                .handle_outage(ReconnectReason::TransportError, &mut rx_a)
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second trigger lands mid-reconnect and must be a no-op.
        let mut rx_b = shutdown_rx.clone();
        sup.handle_outage(ReconnectReason::HeartbeatSilence, &mut rx_b)
            .await;

        let _ = first.await;
        assert_eq!(transport.reconnect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state(), ReconnectState::Connected);
    }

    #[tokio::test]
    async fn test_fresh_stream_without_heartbeat_is_not_silent() {
        let transport = Arc::new(ScriptedTransport::failing());
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (sup, _rx) = supervisor(transport, heartbeat, Duration::from_secs(30));
        assert!(!sup.heartbeat_silent());
    }

    #[tokio::test]
    async fn test_monitor_seeds_silence_clock_at_start() {
        let transport = Arc::new(ScriptedTransport::failing());
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (sup, _rx) = supervisor(transport, heartbeat.clone(), Duration::from_secs(30));

        let (_trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(trigger_rx, stop_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A connection that never delivers a frame still has a running
        // silence clock, so the existing timeout check catches it.
        assert!(heartbeat.load(Ordering::SeqCst) > 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_credential_rejection_fails_without_retry() {
        let transport = Arc::new(ScriptedTransport::auth_rejecting());
        let heartbeat = Arc::new(AtomicU64::new(ts_epoch()));
        let (sup, mut shutdown_rx) = supervisor(transport.clone(), heartbeat, Duration::from_secs(30));

        sup.handle_outage(ReconnectReason::TransportError, &mut shutdown_rx)
            .await;

        // One attempt, then terminal failure; rejected credentials are not
        // re-presented up to the ceiling.
        assert_eq!(sup.state(), ReconnectState::Failed);
        assert_eq!(transport.reconnect_calls.load(Ordering::SeqCst), 1);
        assert!(*shutdown_rx.borrow());
    }
}
