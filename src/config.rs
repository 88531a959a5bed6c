use std::time::Duration;

/// Runtime configuration, sourced from the environment with defaults.
///
/// Credentials come in via `API_KEY`/`API_SECRET`; the secret store that
/// populates those variables is outside this crate.
#[derive(Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub rest_base: String,
    pub ws_base: String,
    /// Listen key renewal period. Keys expire after 60 minutes server-side;
    /// renew at half that.
    pub renewal_secs: u64,
    /// Expected worst-case gap between liveness frames.
    pub heartbeat_interval_secs: u64,
    /// How often the supervisor checks heartbeat silence.
    pub monitor_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Linear backoff unit: attempt N waits `base × N`.
    pub reconnect_base_delay_secs: u64,
    pub frame_queue_capacity: usize,
    /// Consumer-side dequeue timeout; bounds how long shutdown goes unobserved.
    pub queue_poll_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("API_KEY").ok(),
            api_secret: std::env::var("API_SECRET").ok(),
            rest_base: std::env::var("BINANCE_BASE")
                .unwrap_or_else(|_| "https://api.binance.com".to_string()),
            ws_base: std::env::var("BINANCE_WS_BASE")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
            renewal_secs: std::env::var("RENEWAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30 * 60),
            heartbeat_interval_secs: std::env::var("HEARTBEAT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            monitor_interval_secs: std::env::var("MONITOR_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_reconnect_attempts: std::env::var("MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            reconnect_base_delay_secs: std::env::var("RECONNECT_BASE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            frame_queue_capacity: std::env::var("FRAME_QUEUE_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            queue_poll_ms: std::env::var("QUEUE_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
        }
    }

    /// Heartbeat silence beyond this is a liveness failure (2× the interval).
    pub fn heartbeat_silence_limit(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 2)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_delay_secs)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_secs)
    }
}
