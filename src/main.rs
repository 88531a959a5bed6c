use std::sync::Arc;

use anyhow::{bail, Result};

use orderstream::config::Config;
use orderstream::logging::{json_log, log, obj, v_num, v_str, Domain, Level};
use orderstream::metrics::StreamMetrics;
use orderstream::order::EventType;
use orderstream::stream::UserDataStream;
use orderstream::tracker::NullEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    if cfg.api_key.is_none() || cfg.api_secret.is_none() {
        bail!("API_KEY and API_SECRET must be set");
    }
    json_log(
        "startup",
        obj(&[
            ("rest_base", v_str(&cfg.rest_base)),
            ("ws_base", v_str(&cfg.ws_base)),
            ("queue_cap", v_num(cfg.frame_queue_capacity as f64)),
        ]),
    );

    let mut stream = UserDataStream::new(cfg, Arc::new(NullEngine));
    stream.register_callback(
        EventType::ExecutionReport,
        Box::new(|event| {
            log(
                Level::Info,
                Domain::Order,
                "execution_report",
                obj(&[("event", v_str(&format!("{event:?}")))]),
            );
            Ok(())
        }),
    );

    stream.start().await?;

    match stream.seed_open_orders().await {
        Ok(count) => json_log("reconcile", obj(&[("open_orders", v_num(count as f64))])),
        Err(e) => log(
            Level::Warn,
            Domain::Order,
            "reconcile_failed",
            obj(&[("error", v_str(&e.to_string()))]),
        ),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log(Level::Info, Domain::System, "signal_received", obj(&[]));
        }
        _ = stream.wait_closed() => {
            log(Level::Error, Domain::System, "stream_failed", obj(&[]));
        }
    }

    stream.stop().await;

    let metrics = stream.metrics();
    json_log(
        "shutdown",
        obj(&[
            ("frames_received", v_num(StreamMetrics::get(&metrics.frames_received) as f64)),
            ("frames_dropped", v_num(StreamMetrics::get(&metrics.frames_dropped) as f64)),
            ("reconnect_attempts", v_num(StreamMetrics::get(&metrics.reconnect_attempts) as f64)),
        ]),
    );
    Ok(())
}
