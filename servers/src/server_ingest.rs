//! # Ingest Server
//!
//! Runs the ingestion consumer against Redis-backed partitions.
//!
//! ## Functionality:
//! - **Partition Workers**: One task per configured partition list, each
//!   preserving in-partition order and retrying transient failures.
//! - **Admission Monitor**: Samples memory pressure of the configured
//!   services; workers stop fetching while a service is unhealthy.
//! - **Killswitch Reload**: Re-reads the killswitch file on an interval.
//! - **Graceful Shutdown**: `tokio-graceful` cancels every loop on signal and
//!   waits for in-flight messages to settle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lib_ingest::backpressure::AdmissionMonitor;
use lib_ingest::collaborators::{
    CacheAttachmentStore, CacheBackend, CacheProcessingStore, NoEventLookup, StaticProjectResolver, TracingMetrics,
    TracingUsageAccountant,
};
use lib_ingest::configs::{load_config, Settings};
use lib_ingest::connections::cache_redis::{connect, RedisCache, RedisListSource, RedisNodeProbe, RedisTaskQueue};
use lib_ingest::core::{
    run_partition, AttachmentCache, CacheUserReportStore, ChunkAssembler, DedupGuard, DispatcherDeps,
    DispatcherOptions, IngestConsumer, IngestDispatcher, KillswitchStore, UserReportProcessor,
};
use lib_ingest::loggers::setup_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load_config().context("failed to load configuration")?;

    let _log_guard = setup_logging(&settings.log_dir, "server_ingest", &settings.log_level)
        .context("failed to initialize logging")?;
    info!(partitions = ?settings.partitions, services = settings.services.len(), "configuration loaded");

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| async move {
        if let Err(e) = tokio_main(guard, settings).await {
            error!("ingest server failed: {:#}", e);
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64()),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }

    info!("Bye!");
    Ok(())
}

async fn tokio_main(shutdown_guard: ShutdownGuard, settings: Settings) -> Result<()> {
    let token = CancellationToken::new();
    let timeout = settings.operation_timeout;
    let ttl = settings.cache_ttl;

    // --- Phase 1: connections ---
    let conn = connect(&settings.redis_url)
        .await
        .with_context(|| format!("failed to connect to {}", settings.redis_url))?;
    let cache: Arc<dyn CacheBackend> = Arc::new(RedisCache::new(conn.clone()));

    // --- Phase 2: killswitches ---
    let killswitches = KillswitchStore::default();
    let mut background = Vec::new();
    if let Some(path) = settings.killswitch_path.clone() {
        killswitches
            .load_file(&path)
            .with_context(|| format!("failed to load killswitches from {}", path.display()))?;
        background.push(tokio::spawn(killswitches.clone().watch_file(
            path,
            settings.killswitch_reload,
            token.clone(),
        )));
    }

    // --- Phase 3: admission monitor ---
    let (monitor, admission) = AdmissionMonitor::new(
        settings.services.clone(),
        Arc::new(RedisNodeProbe),
        settings.health,
        settings.node_timeout,
    );
    background.push(tokio::spawn(monitor.run(settings.monitor_interval, token.clone())));

    // --- Phase 4: consumer ---
    let deps = DispatcherDeps {
        dedup: DedupGuard::new(cache.clone(), ttl, timeout),
        killswitches: killswitches.clone(),
        processing_store: Arc::new(CacheProcessingStore::new(cache.clone(), ttl)),
        attachments: AttachmentCache::new(cache.clone(), ttl, timeout),
        tasks: Arc::new(RedisTaskQueue::new(conn.clone(), settings.task_queue_prefix.clone())),
        usage: Arc::new(TracingUsageAccountant),
        metrics: Arc::new(TracingMetrics),
    };
    let options = DispatcherOptions {
        operation_timeout: timeout,
        reprocess_only_stuck_events: settings.reprocess_only_stuck_events,
        internal_project_id: settings.internal_project_id,
        ..DispatcherOptions::default()
    };
    let dispatcher = Arc::new(IngestDispatcher::new(deps, options));
    background.push(tokio::spawn(log_accepted(dispatcher.clone(), token.clone())));

    let assembler = ChunkAssembler::new(
        AttachmentCache::new(cache.clone(), ttl, timeout),
        Arc::new(NoEventLookup),
        Arc::new(CacheAttachmentStore::new(cache.clone(), ttl)),
        killswitches,
        timeout,
    );
    let reports = UserReportProcessor::new(Arc::new(CacheUserReportStore::new(cache.clone(), ttl)), timeout);
    let consumer = Arc::new(IngestConsumer::new(
        Arc::new(StaticProjectResolver::new(settings.projects.clone())),
        dispatcher,
        Arc::new(assembler),
        Arc::new(reports),
        timeout,
    ));

    // --- Phase 5: partition workers ---
    let mut workers = Vec::with_capacity(settings.partitions.len());
    for partition in &settings.partitions {
        let source = RedisListSource::new(conn.clone(), partition.clone());
        source
            .recover()
            .await
            .with_context(|| format!("failed to recover in-flight messages of {}", partition))?;
        workers.push(tokio::spawn(run_partition(
            Arc::new(source),
            consumer.clone(),
            Some(admission.clone()),
            token.clone(),
            settings.retry,
        )));
    }
    info!(workers = workers.len(), "ingest server running");

    shutdown_guard.cancelled().await;
    info!("Signal received: initiate graceful shutdown");
    token.cancel();

    let mut acknowledged = 0u64;
    for worker in workers {
        match worker.await {
            Ok(count) => acknowledged += count,
            Err(e) => error!("partition worker panicked: {}", e),
        }
    }
    for task in background {
        if let Err(e) = task.await {
            error!("background task panicked: {}", e);
        }
    }

    info!(acknowledged, "ingest server stopped");
    Ok(())
}

async fn log_accepted(dispatcher: Arc<IngestDispatcher>, token: CancellationToken) {
    let mut accepted = dispatcher.subscribe();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = accepted.recv() => match event {
                Ok(event) => debug!(
                    project_id = event.project.id,
                    remote_addr = ?event.remote_addr,
                    event_type = event.data.event_type_tag(),
                    "event accepted"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "accepted-event listener lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
