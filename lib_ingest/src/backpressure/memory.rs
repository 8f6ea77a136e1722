//! # Node Memory Readings
//!
//! A [`MemoryUsage`] is one node's memory at one instant. Readings are
//! recomputed on every poll and never stored.

use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use serde::Serialize;
use tracing::warn;

use crate::collaborators::CallResult;
use crate::core::effects::bounded;
use crate::error::CollaboratorError;

/// Memory of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    /// Node address.
    pub host: String,
    /// Bytes in use.
    pub used: u64,
    /// Bytes still available.
    pub available: u64,
    /// `used / (used + available)`; `1.0` when nothing is available.
    pub percentage: f64,
}

impl MemoryUsage {
    /// Builds a reading and computes its percentage.
    pub fn new(host: impl Into<String>, used: u64, available: u64) -> Self {
        let total = used.saturating_add(available);
        let percentage = if total == 0 {
            1.0
        } else {
            used as f64 / total as f64
        };
        Self {
            host: host.into(),
            used,
            available,
            percentage,
        }
    }

    /// The reading reported for a node that could not be read.
    pub fn unreachable(host: impl Into<String>) -> Self {
        Self::new(host, 0, 0)
    }

    /// Builds a reading from the output of Redis `INFO memory`.
    ///
    /// `used` is `used_memory`. The limit is `maxmemory`, or
    /// `total_system_memory` when no `maxmemory` is configured.
    pub fn from_redis_info(host: impl Into<String>, info: &str) -> Result<Self, CollaboratorError> {
        let field = |name: &str| -> Option<u64> {
            info.lines()
                .filter_map(|line| line.trim().split_once(':'))
                .find(|(key, _)| *key == name)
                .and_then(|(_, value)| value.trim().parse().ok())
        };

        let used = field("used_memory")
            .ok_or_else(|| CollaboratorError::Serialization("INFO memory lacks used_memory".to_string()))?;
        let limit = match field("maxmemory") {
            Some(max) if max > 0 => max,
            _ => field("total_system_memory").filter(|total| *total > 0).ok_or_else(|| {
                CollaboratorError::Serialization("INFO memory reports no memory limit".to_string())
            })?,
        };

        Ok(Self::new(host, used, limit.saturating_sub(used)))
    }
}

/// Node address with any credentials removed, for logs and readings.
pub fn redact_node(node: &str) -> String {
    match (node.split_once("://"), node.rsplit_once('@')) {
        (Some((scheme, _)), Some((_, host))) => format!("{}://{}", scheme, host),
        _ => node.to_string(),
    }
}

/// Reads the memory of one node.
pub trait NodeProbe: Send + Sync {
    /// Samples `node`. Dropping the returned future must release any
    /// connection it holds.
    fn memory<'a>(&'a self, node: &'a str) -> BoxFuture<'a, CallResult<MemoryUsage>>;
}

/// Samples every node of a cluster concurrently and returns one reading per
/// node, in node order. A node that fails or exceeds `timeout` is reported
/// through [`MemoryUsage::unreachable`].
pub async fn iter_cluster_memory_usage(
    probe: &dyn NodeProbe,
    nodes: &[String],
    timeout: Duration,
) -> Vec<MemoryUsage> {
    let reads = nodes.iter().map(|node| async move {
        match bounded("node.memory", timeout, probe.memory(node)).await {
            Ok(usage) => usage,
            Err(e) => {
                let host = redact_node(node);
                warn!(node = %host, error = %e, "node unreachable, assuming full memory");
                MemoryUsage::unreachable(host)
            }
        }
    });
    join_all(reads).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedProbe(HashMap<String, (u64, u64)>);

    impl NodeProbe for FixedProbe {
        fn memory<'a>(&'a self, node: &'a str) -> BoxFuture<'a, CallResult<MemoryUsage>> {
            Box::pin(async move {
                match self.0.get(node) {
                    Some((used, available)) => Ok(MemoryUsage::new(node, *used, *available)),
                    None if node == "slow" => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Err(CollaboratorError::Unavailable(node.to_string()))
                    }
                    None => Err(CollaboratorError::Unavailable(node.to_string())),
                }
            })
        }
    }

    #[test]
    fn percentage_is_used_over_total() {
        let usage = MemoryUsage::new("a", 900, 100);
        assert!((usage.percentage - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn node_credentials_are_redacted() {
        assert_eq!(redact_node("redis://:secret@10.0.0.1:6379/0"), "redis://10.0.0.1:6379/0");
        assert_eq!(redact_node("redis://10.0.0.1:6379"), "redis://10.0.0.1:6379");
    }

    #[test]
    fn unreachable_is_maximal_pressure() {
        let usage = MemoryUsage::unreachable("a");
        assert_eq!(usage.available, 0);
        assert_eq!(usage.percentage, 1.0);
    }

    #[test]
    fn parses_info_memory() {
        let info = "# Memory\r\nused_memory:900\r\nused_memory_human:900B\r\nmaxmemory:1000\r\ntotal_system_memory:8000\r\n";
        let usage = MemoryUsage::from_redis_info("a", info).unwrap();
        assert_eq!((usage.used, usage.available), (900, 100));

        let unlimited = "used_memory:1000\nmaxmemory:0\ntotal_system_memory:4000\n";
        let usage = MemoryUsage::from_redis_info("a", unlimited).unwrap();
        assert_eq!((usage.used, usage.available), (1000, 3000));
        assert!(usage.used > 0 && usage.available > 0);
        assert!(usage.percentage > 0.0 && usage.percentage < 1.0);

        assert!(MemoryUsage::from_redis_info("a", "maxmemory:10").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn every_node_yields_a_reading() {
        let probe = FixedProbe(HashMap::from([("a".to_string(), (900, 100))]));
        let nodes = vec!["a".to_string(), "down".to_string(), "slow".to_string()];

        let readings = iter_cluster_memory_usage(&probe, &nodes, Duration::from_millis(100)).await;

        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0], MemoryUsage::new("a", 900, 100));
        assert_eq!(readings[1], MemoryUsage::unreachable("down"));
        assert_eq!(readings[2], MemoryUsage::unreachable("slow"));
    }
}
