//! # Admission Monitor
//!
//! Polls every configured service on a fixed interval and publishes one
//! [`ServiceSnapshot`] per service through a `watch` channel. Each poll is
//! an independent snapshot; nothing is carried over from the previous one.
//!
//! Readers hold a [`MonitorHandle`] and always see the last published
//! verdicts without waiting. Before the first poll completes every service
//! reads as healthy.
//!
//! Polls run one at a time, so there is never more than one poll in flight
//! per service. Cancelling the monitor drops the running poll together with
//! its node connections.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backpressure::memory::{iter_cluster_memory_usage, MemoryUsage, NodeProbe};

/// A named backing cluster and its nodes. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name, e.g. `"cache"`.
    pub name: String,
    /// Node addresses.
    pub nodes: Vec<String>,
}

/// Turns readings into a verdict: a service is unhealthy when more than
/// `max_unhealthy_ratio` of its nodes are above `high_watermark`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Memory fraction above which a node counts as pressured.
    pub high_watermark: f64,
    /// Fraction of pressured nodes a service tolerates.
    pub max_unhealthy_ratio: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            max_unhealthy_ratio: 0.0,
        }
    }
}

impl HealthPolicy {
    /// Whether a service with these readings is healthy. A service without
    /// nodes is healthy.
    pub fn is_healthy(&self, readings: &[MemoryUsage]) -> bool {
        if readings.is_empty() {
            return true;
        }
        let pressured = readings
            .iter()
            .filter(|r| r.percentage > self.high_watermark)
            .count();
        (pressured as f64 / readings.len() as f64) <= self.max_unhealthy_ratio
    }
}

/// One poll's result for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    /// Service name.
    pub service: String,
    /// One reading per node, in node order.
    pub readings: Vec<MemoryUsage>,
    /// The policy verdict.
    pub healthy: bool,
    /// When the poll finished.
    pub sampled_at: DateTime<Utc>,
}

type Snapshots = Arc<BTreeMap<String, ServiceSnapshot>>;

/// Read side of the monitor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    rx: watch::Receiver<Snapshots>,
}

impl MonitorHandle {
    /// All snapshots of the last poll.
    pub fn snapshots(&self) -> Snapshots {
        self.rx.borrow().clone()
    }

    /// The last snapshot of one service.
    pub fn snapshot(&self, service: &str) -> Option<ServiceSnapshot> {
        self.rx.borrow().get(service).cloned()
    }

    /// Verdict of one service; `true` when it has not been sampled.
    pub fn is_healthy(&self, service: &str) -> bool {
        self.rx.borrow().get(service).is_none_or(|s| s.healthy)
    }

    /// `true` when no service is unhealthy.
    pub fn all_healthy(&self) -> bool {
        self.rx.borrow().values().all(|s| s.healthy)
    }

    /// Names of the services currently unhealthy.
    pub fn unhealthy_services(&self) -> Vec<String> {
        self.rx
            .borrow()
            .values()
            .filter(|s| !s.healthy)
            .map(|s| s.service.clone())
            .collect()
    }

    /// Waits for the next published poll. Returns `false` once the monitor
    /// is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// # Admission Monitor
///
/// Owns the services, the probe and the publishing side of the channel.
pub struct AdmissionMonitor {
    services: Vec<ServiceDefinition>,
    probe: Arc<dyn NodeProbe>,
    policy: HealthPolicy,
    node_timeout: Duration,
    tx: watch::Sender<Snapshots>,
}

impl AdmissionMonitor {
    /// Creates the monitor and the first reader handle.
    pub fn new(
        services: Vec<ServiceDefinition>,
        probe: Arc<dyn NodeProbe>,
        policy: HealthPolicy,
        node_timeout: Duration,
    ) -> (Self, MonitorHandle) {
        let (tx, rx) = watch::channel(Snapshots::default());
        let monitor = Self {
            services,
            probe,
            policy,
            node_timeout,
            tx,
        };
        (monitor, MonitorHandle { rx })
    }

    /// Another reader handle.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Samples every service once and publishes the result.
    pub async fn poll_once(&self) -> Snapshots {
        let polls = self.services.iter().map(|service| async move {
            let readings =
                iter_cluster_memory_usage(self.probe.as_ref(), &service.nodes, self.node_timeout).await;
            let healthy = self.policy.is_healthy(&readings);
            ServiceSnapshot {
                service: service.name.clone(),
                readings,
                healthy,
                sampled_at: Utc::now(),
            }
        });

        let snapshots: BTreeMap<String, ServiceSnapshot> = join_all(polls)
            .await
            .into_iter()
            .map(|s| (s.service.clone(), s))
            .collect();

        let previous = self.tx.borrow().clone();
        for (name, snapshot) in &snapshots {
            let was_healthy = previous.get(name).is_none_or(|s| s.healthy);
            if was_healthy && !snapshot.healthy {
                warn!(service = %name, readings = ?snapshot.readings, "service under memory pressure");
            } else if !was_healthy && snapshot.healthy {
                info!(service = %name, "service recovered");
            }
        }

        let snapshots = Arc::new(snapshots);
        self.tx.send_replace(snapshots.clone());
        snapshots
    }

    /// Polls every `interval` until `token` is cancelled.
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(services = self.services.len(), interval_ms = interval.as_millis() as u64, "admission monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                snapshots = self.poll_once() => {
                    debug!(services = snapshots.len(), "admission monitor poll published");
                }
            }
        }

        info!("admission monitor stopped");
    }
}
