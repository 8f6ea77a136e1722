//! # Collaborator Interfaces
//!
//! The ingestion core talks to the outside world only through the traits in
//! this module. Each trait returns a [`BoxFuture`] so implementations can sit
//! behind `Arc<dyn _>` and be swapped between Redis, in-process channels and
//! test fakes without touching the dispatcher.
//!
//! Callers never await these futures directly; they go through
//! [`crate::core::effects::bounded`] (correctness-bearing calls) or
//! [`crate::core::effects::NonCritical`] (best-effort calls).
//!
//! The bottom half of the file holds the simple backends used by the
//! binaries: cache-backed processing and attachment stores, a static project
//! table, a channel task queue and `tracing`-backed metrics/accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::CollaboratorError;
use crate::model::{Attachment, CacheKey, DownstreamTask, EventData, Project};

/// Convenience alias for collaborator results.
pub type CallResult<T> = Result<T, CollaboratorError>;

/// A key-value cache with per-entry expiry. Backs deduplication, the
/// attachment cache and the cache-backed stores below.
pub trait CacheBackend: Send + Sync {
    /// Reads a key; `None` when absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CallResult<Option<Bytes>>>;
    /// Writes a key with a time-to-live.
    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CallResult<()>>;
    /// Writes a key only if it is absent. Returns `true` when written.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, CallResult<bool>>;
    /// Removes keys. Missing keys are not an error.
    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, CallResult<()>>;
}

/// Resolves a project id to its identity and entitlements. Failures are
/// fatal for the message: without a project nothing can be processed.
pub trait ProjectResolver: Send + Sync {
    /// Looks up a project.
    fn resolve(&self, project_id: u64) -> BoxFuture<'_, CallResult<Project>>;
}

/// The external store holding decoded events until downstream tasks pick
/// them up.
pub trait ProcessingStore: Send + Sync {
    /// Persists an event and returns its handle.
    fn store<'a>(
        &'a self,
        project_id: u64,
        event_id: &'a str,
        data: &'a EventData,
    ) -> BoxFuture<'a, CallResult<CacheKey>>;
    /// Whether an event is currently held by the store.
    fn exists<'a>(&'a self, project_id: u64, event_id: &'a str) -> BoxFuture<'a, CallResult<bool>>;
}

/// Outbound queue of downstream tasks.
///
/// Contract: once `enqueue` returns `Ok`, the task is delivered at least once.
/// The queue is independent from broker acknowledgement, so a redelivered
/// broker message may enqueue the same task twice.
pub trait TaskQueue: Send + Sync {
    /// Hands one task off.
    fn enqueue(&self, task: DownstreamTask) -> BoxFuture<'_, CallResult<()>>;
}

/// Looks up an already stored event to find its group.
pub trait EventLookup: Send + Sync {
    /// Group id of a stored event, `None` if the event is not known yet.
    /// May fail with [`CollaboratorError::RateLimited`].
    fn group_id<'a>(&'a self, project_id: u64, event_id: &'a str) -> BoxFuture<'a, CallResult<Option<u64>>>;
}

/// Final destination of individually finalized attachments.
pub trait AttachmentStore: Send + Sync {
    /// Persists an assembled attachment. Must tolerate being called twice
    /// for the same attachment.
    fn save<'a>(
        &'a self,
        cache_key: &'a CacheKey,
        attachment: &'a Attachment,
        project: &'a Project,
        event_id: &'a str,
        group_id: Option<u64>,
    ) -> BoxFuture<'a, CallResult<()>>;
}

/// Unit of an accounted quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUnit {
    /// Raw bytes.
    Bytes,
}

impl UsageUnit {
    /// Stable name for logs and tags.
    pub fn as_str(self) -> &'static str {
        match self {
            UsageUnit::Bytes => "bytes",
        }
    }
}

/// Records resource usage per feature. Best-effort.
pub trait UsageAccountant: Send + Sync {
    /// Records `amount` units consumed by `feature` on `resource`.
    fn record<'a>(
        &'a self,
        resource: &'a str,
        feature: &'a str,
        amount: u64,
        unit: UsageUnit,
    ) -> BoxFuture<'a, CallResult<()>>;
}

/// Counter metrics. Best-effort.
pub trait MetricsSink: Send + Sync {
    /// Increments a counter.
    fn incr<'a>(
        &'a self,
        key: &'a str,
        amount: u64,
        tags: &'a [(&'static str, String)],
    ) -> BoxFuture<'a, CallResult<()>>;
}

// --- Simple backends ---

/// Emits metrics as `tracing` debug events.
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr<'a>(
        &'a self,
        key: &'a str,
        amount: u64,
        tags: &'a [(&'static str, String)],
    ) -> BoxFuture<'a, CallResult<()>> {
        Box::pin(async move {
            debug!(metric = key, amount, ?tags, "metric");
            Ok(())
        })
    }
}

/// Emits usage records as `tracing` debug events.
#[derive(Debug, Default, Clone)]
pub struct TracingUsageAccountant;

impl UsageAccountant for TracingUsageAccountant {
    fn record<'a>(
        &'a self,
        resource: &'a str,
        feature: &'a str,
        amount: u64,
        unit: UsageUnit,
    ) -> BoxFuture<'a, CallResult<()>> {
        Box::pin(async move {
            debug!(resource, feature, amount, unit = unit.as_str(), "usage");
            Ok(())
        })
    }
}

/// An event lookup that never knows any event.
#[derive(Debug, Default, Clone)]
pub struct NoEventLookup;

impl EventLookup for NoEventLookup {
    fn group_id<'a>(&'a self, _project_id: u64, _event_id: &'a str) -> BoxFuture<'a, CallResult<Option<u64>>> {
        Box::pin(async { Ok(None) })
    }
}

/// A fixed table of projects, typically loaded from the configuration file.
#[derive(Debug, Default, Clone)]
pub struct StaticProjectResolver {
    projects: HashMap<u64, Project>,
}

impl StaticProjectResolver {
    /// Builds the table.
    pub fn new(projects: impl IntoIterator<Item = Project>) -> Self {
        Self {
            projects: projects.into_iter().map(|p| (p.id, p)).collect(),
        }
    }
}

impl ProjectResolver for StaticProjectResolver {
    fn resolve(&self, project_id: u64) -> BoxFuture<'_, CallResult<Project>> {
        let found = self.projects.get(&project_id).cloned();
        Box::pin(async move {
            found.ok_or_else(|| CollaboratorError::NotFound(format!("project {}", project_id)))
        })
    }
}

/// Processing store that keeps serialized events in a [`CacheBackend`].
pub struct CacheProcessingStore {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl CacheProcessingStore {
    /// Creates the store; entries expire after `ttl`.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }
}

impl ProcessingStore for CacheProcessingStore {
    fn store<'a>(
        &'a self,
        project_id: u64,
        event_id: &'a str,
        data: &'a EventData,
    ) -> BoxFuture<'a, CallResult<CacheKey>> {
        Box::pin(async move {
            let key = CacheKey::for_event(project_id, event_id);
            let value = Bytes::from(serde_json::to_vec(data)?);
            self.backend.set(key.as_str(), value, self.ttl).await?;
            Ok(key)
        })
    }

    fn exists<'a>(&'a self, project_id: u64, event_id: &'a str) -> BoxFuture<'a, CallResult<bool>> {
        Box::pin(async move {
            let key = CacheKey::for_event(project_id, event_id);
            Ok(self.backend.get(key.as_str()).await?.is_some())
        })
    }
}

/// Attachment store that keeps finalized attachments in a [`CacheBackend`].
pub struct CacheAttachmentStore {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl CacheAttachmentStore {
    /// Creates the store; entries expire after `ttl`.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }
}

impl AttachmentStore for CacheAttachmentStore {
    fn save<'a>(
        &'a self,
        cache_key: &'a CacheKey,
        attachment: &'a Attachment,
        project: &'a Project,
        event_id: &'a str,
        group_id: Option<u64>,
    ) -> BoxFuture<'a, CallResult<()>> {
        Box::pin(async move {
            let key = format!("{}:saved:{}", cache_key, attachment.id);
            self.backend.set(&key, attachment.data.clone(), self.ttl).await?;
            info!(
                project_id = project.id,
                event_id,
                ?group_id,
                attachment_id = %attachment.id,
                size = attachment.data.len(),
                "attachment saved"
            );
            Ok(())
        })
    }
}

/// In-process task queue backed by a bounded `mpsc` channel.
///
/// A full channel makes `enqueue` wait, and the dispatcher's per-call
/// timeout turns a stuck consumer into a retriable failure.
#[derive(Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::Sender<DownstreamTask>,
}

impl ChannelTaskQueue {
    /// Creates the queue and the receiving half for the task runner.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DownstreamTask>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl TaskQueue for ChannelTaskQueue {
    fn enqueue(&self, task: DownstreamTask) -> BoxFuture<'_, CallResult<()>> {
        Box::pin(async move {
            self.sender
                .send(task)
                .await
                .map_err(|_| CollaboratorError::Unavailable("task queue receiver dropped".to_string()))
        })
    }
}
