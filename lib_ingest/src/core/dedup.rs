//! # Deduplication Guard
//!
//! An approximate record of recently dispatched events. It answers "has this
//! `(project_id, event_id)` been dispatched in the last hour?" and nothing
//! stronger.
//!
//! ## Race Window
//!
//! No lock spans the check, the processing-store write and the record write.
//! The record is only written after a fully successful dispatch, so two
//! deliveries of the same event that both pass [`DedupGuard::check`] before
//! either reaches [`DedupGuard::remember`] are both dispatched. Downstream
//! tasks must tolerate the duplicate. A lost record (cache eviction or
//! flush) has the same effect.
//!
//! What the guard never does is turn a cache outage into "not seen": a
//! failed read comes back as an error and the message is retried later.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::collaborators::CacheBackend;
use crate::core::effects::bounded;
use crate::error::CollaboratorError;

/// Lifetime of a dedup record.
pub const DEDUP_TTL: Duration = Duration::from_secs(3600);

const SENTINEL: &[u8] = b"1";

/// Result of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStatus {
    /// No record; the event should be processed.
    Fresh,
    /// A record exists; the event was dispatched recently.
    SeenRecently,
}

/// Best-effort duplicate guard over a [`CacheBackend`].
#[derive(Clone)]
pub struct DedupGuard {
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
    timeout: Duration,
}

impl DedupGuard {
    /// Creates a guard whose records live for `ttl` and whose cache calls are
    /// bounded by `timeout`.
    pub fn new(cache: Arc<dyn CacheBackend>, ttl: Duration, timeout: Duration) -> Self {
        Self { cache, ttl, timeout }
    }

    /// Cache key of the record for one event.
    pub fn key(project_id: u64, event_id: &str) -> String {
        format!("ev:{}:{}", project_id, event_id)
    }

    /// Looks up the record. A cache failure is returned, never mapped to
    /// [`DedupStatus::Fresh`].
    pub async fn check(&self, project_id: u64, event_id: &str) -> Result<DedupStatus, CollaboratorError> {
        let key = Self::key(project_id, event_id);
        let found = bounded("dedup.check", self.timeout, self.cache.get(&key)).await?;
        Ok(match found {
            Some(_) => DedupStatus::SeenRecently,
            None => DedupStatus::Fresh,
        })
    }

    /// Writes the record after a successful dispatch.
    pub async fn remember(&self, project_id: u64, event_id: &str) -> Result<(), CollaboratorError> {
        let key = Self::key(project_id, event_id);
        bounded(
            "dedup.remember",
            self.timeout,
            self.cache.set(&key, Bytes::from_static(SENTINEL), self.ttl),
        )
        .await?;
        debug!(project_id, event_id, "dedup record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::cache_memory::InMemoryCache;

    fn guard(cache: Arc<InMemoryCache>) -> DedupGuard {
        DedupGuard::new(cache, DEDUP_TTL, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn records_are_scoped_by_project_and_event() {
        let cache = Arc::new(InMemoryCache::new());
        let guard = guard(cache.clone());

        assert_eq!(guard.check(7, "e1").await.unwrap(), DedupStatus::Fresh);
        guard.remember(7, "e1").await.unwrap();

        assert_eq!(guard.check(7, "e1").await.unwrap(), DedupStatus::SeenRecently);
        assert_eq!(guard.check(8, "e1").await.unwrap(), DedupStatus::Fresh);
        assert_eq!(cache.keys_with_prefix("ev:"), vec!["ev:7:e1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_after_the_ttl() {
        let cache = Arc::new(InMemoryCache::new());
        let guard = guard(cache);

        guard.remember(7, "e1").await.unwrap();
        tokio::time::advance(DEDUP_TTL + Duration::from_secs(1)).await;
        assert_eq!(guard.check(7, "e1").await.unwrap(), DedupStatus::Fresh);
    }

    #[tokio::test]
    async fn concurrent_checks_before_the_write_both_pass() {
        // Two redeliveries racing: both observe "fresh" and both would
        // dispatch. The guard tolerates this rather than preventing it.
        let cache = Arc::new(InMemoryCache::new());
        let guard = guard(cache);

        let (first, second) = tokio::join!(guard.check(7, "e1"), guard.check(7, "e1"));
        assert_eq!(first.unwrap(), DedupStatus::Fresh);
        assert_eq!(second.unwrap(), DedupStatus::Fresh);

        guard.remember(7, "e1").await.unwrap();
        guard.remember(7, "e1").await.unwrap();
        assert_eq!(guard.check(7, "e1").await.unwrap(), DedupStatus::SeenRecently);
    }
}
