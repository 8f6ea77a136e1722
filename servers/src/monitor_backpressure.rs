//! # Backpressure Monitor
//!
//! Standalone admission monitor. Polls the configured services on the
//! configured interval and logs every reading and verdict, without consuming
//! any partition.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lib_ingest::backpressure::{AdmissionMonitor, MonitorHandle};
use lib_ingest::configs::{load_config, Settings};
use lib_ingest::connections::cache_redis::RedisNodeProbe;
use lib_ingest::loggers::setup_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load_config().context("failed to load configuration")?;

    let _log_guard = setup_logging(&settings.log_dir, "monitor_backpressure", &settings.log_level)
        .context("failed to initialize logging")?;

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| tokio_main(guard, settings));

    match shutdown.shutdown_with_limit(Duration::from_secs(5)).await {
        Ok(elapsed) => info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64()),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }
    Ok(())
}

async fn tokio_main(shutdown_guard: ShutdownGuard, settings: Settings) {
    let token = CancellationToken::new();
    let (monitor, handle) = AdmissionMonitor::new(
        settings.services,
        Arc::new(RedisNodeProbe),
        settings.health,
        settings.node_timeout,
    );
    info!(
        interval_ms = settings.monitor_interval.as_millis() as u64,
        high_watermark = settings.health.high_watermark,
        max_unhealthy_ratio = settings.health.max_unhealthy_ratio,
        "backpressure monitor started"
    );

    let poller = tokio::spawn(monitor.run(settings.monitor_interval, token.clone()));
    let reporter = tokio::spawn(report(handle, token.clone()));

    shutdown_guard.cancelled().await;
    token.cancel();
    let (poller, reporter) = tokio::join!(poller, reporter);
    if let Err(e) = poller {
        error!("monitor task panicked: {}", e);
    }
    if let Err(e) = reporter {
        error!("reporter task panicked: {}", e);
    }
}

async fn report(mut handle: MonitorHandle, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            alive = handle.changed() => {
                if !alive {
                    break;
                }
                for snapshot in handle.snapshots().values() {
                    for reading in &snapshot.readings {
                        info!(
                            service = %snapshot.service,
                            host = %reading.host,
                            used = reading.used,
                            available = reading.available,
                            percentage = reading.percentage,
                            "memory reading"
                        );
                    }
                    if snapshot.healthy {
                        info!(service = %snapshot.service, "service healthy");
                    } else {
                        warn!(service = %snapshot.service, "service unhealthy");
                    }
                }
            }
        }
    }
}
