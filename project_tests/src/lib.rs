//! # Pipeline Test Harness
//!
//! In-memory stand-ins for every collaborator of the ingestion core, with
//! counters and failure switches, plus a [`Pipeline`] that wires them the
//! way the ingest server does.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use lib_ingest::backpressure::{MemoryUsage, NodeProbe};
use lib_ingest::collaborators::{
    CacheAttachmentStore, CacheBackend, CallResult, MetricsSink, NoEventLookup, ProcessingStore,
    StaticProjectResolver, TaskQueue, UsageAccountant, UsageUnit,
};
use lib_ingest::connections::cache_memory::InMemoryCache;
use lib_ingest::core::{
    AttachmentCache, CacheUserReportStore, ChunkAssembler, DedupGuard, Delivery, DispatcherDeps,
    DispatcherOptions, IngestConsumer, IngestDispatcher, KillswitchStore, MessageSource, UserReportProcessor,
    DEDUP_TTL,
};
use lib_ingest::{
    AcceptedEvent, BrokerMessage, CacheKey, CollaboratorError, DownstreamTask, EventData, IngestMessage,
    OrganizationFeatures, Project, TaskKind,
};

/// Per-call budget used by the harness.
pub const TIMEOUT: Duration = Duration::from_millis(200);

/// An [`InMemoryCache`] whose reads and writes can be made to fail.
#[derive(Default)]
pub struct FaultyCache {
    /// The real storage.
    pub inner: InMemoryCache,
    /// Fail every `get`.
    pub fail_reads: AtomicBool,
    /// Fail every `set` and `set_if_absent`.
    pub fail_writes: AtomicBool,
}

impl FaultyCache {
    fn unavailable() -> CollaboratorError {
        CollaboratorError::Unavailable("cache down".to_string())
    }
}

impl CacheBackend for FaultyCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CallResult<Option<Bytes>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::unavailable()) });
        }
        self.inner.get(key)
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CallResult<()>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::unavailable()) });
        }
        self.inner.set(key, value, ttl)
    }

    fn set_if_absent<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CallResult<bool>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::unavailable()) });
        }
        self.inner.set_if_absent(key, value, ttl)
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, CallResult<()>> {
        self.inner.delete(keys)
    }
}

/// Processing store that records every write and can panic on the next
/// `n` writes.
#[derive(Default)]
pub struct RecordingStore {
    /// `(project_id, event_id)` of every write, in order.
    pub writes: Mutex<Vec<(u64, String)>>,
    /// Remaining writes that panic.
    pub panic_next: AtomicUsize,
}

impl RecordingStore {
    /// Number of writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

impl ProcessingStore for RecordingStore {
    fn store<'a>(&'a self, project_id: u64, event_id: &'a str, _data: &'a EventData) -> BoxFuture<'a, CallResult<CacheKey>> {
        let panicking = self
            .panic_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicking {
            panic!("processing store bug");
        }
        self.writes.lock().unwrap().push((project_id, event_id.to_string()));
        Box::pin(async move { Ok(CacheKey::for_event(project_id, event_id)) })
    }

    fn exists<'a>(&'a self, project_id: u64, event_id: &'a str) -> BoxFuture<'a, CallResult<bool>> {
        let found = self
            .writes
            .lock()
            .unwrap()
            .iter()
            .any(|(p, e)| *p == project_id && e == event_id);
        Box::pin(async move { Ok(found) })
    }
}

/// Task queue that records tasks and can fail the next `n` enqueues.
#[derive(Default)]
pub struct RecordingTasks {
    /// Every accepted task, in order.
    pub tasks: Mutex<Vec<DownstreamTask>>,
    /// Remaining enqueues to fail.
    pub fail_next: AtomicUsize,
}

impl RecordingTasks {
    /// Kinds of the accepted tasks, in order.
    pub fn kinds(&self) -> Vec<TaskKind> {
        self.tasks.lock().unwrap().iter().map(|t| t.kind).collect()
    }

    /// Event ids of the accepted tasks, in order.
    pub fn event_ids(&self) -> Vec<String> {
        self.tasks.lock().unwrap().iter().map(|t| t.args.event_id.clone()).collect()
    }
}

impl TaskQueue for RecordingTasks {
    fn enqueue(&self, task: DownstreamTask) -> BoxFuture<'_, CallResult<()>> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Box::pin(async { Err(CollaboratorError::Unavailable("task queue down".to_string())) });
        }
        self.tasks.lock().unwrap().push(task);
        Box::pin(async { Ok(()) })
    }
}

/// Usage accountant that records calls and can be made to fail.
#[derive(Default)]
pub struct RecordingUsage {
    /// `(resource, feature, amount)` of every successful record.
    pub records: Mutex<Vec<(String, String, u64)>>,
    /// Fail every call.
    pub fail: AtomicBool,
}

impl UsageAccountant for RecordingUsage {
    fn record<'a>(&'a self, resource: &'a str, feature: &'a str, amount: u64, _unit: UsageUnit) -> BoxFuture<'a, CallResult<()>> {
        if self.fail.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CollaboratorError::Unavailable("accountant down".to_string())) });
        }
        self.records
            .lock()
            .unwrap()
            .push((resource.to_string(), feature.to_string(), amount));
        Box::pin(async { Ok(()) })
    }
}

/// Metrics sink that records every increment.
#[derive(Default)]
pub struct RecordingMetrics {
    /// `(key, amount, tags)` of every increment, in order.
    pub calls: Mutex<Vec<(String, u64, Vec<(&'static str, String)>)>>,
}

impl RecordingMetrics {
    /// `(amount, tags)` of the increments of `key`.
    pub fn named(&self, key: &str) -> Vec<(u64, Vec<(&'static str, String)>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| k == key)
            .map(|(_, amount, tags)| (*amount, tags.clone()))
            .collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn incr<'a>(&'a self, key: &'a str, amount: u64, tags: &'a [(&'static str, String)]) -> BoxFuture<'a, CallResult<()>> {
        self.calls
            .lock()
            .unwrap()
            .push((key.to_string(), amount, tags.to_vec()));
        Box::pin(async { Ok(()) })
    }
}

/// A partition held in memory. `fetch` returns the head until it is acked.
#[derive(Default)]
pub struct VecSource {
    /// Pending messages, head first.
    pub pending: Mutex<VecDeque<Bytes>>,
    /// Acknowledged messages, in order.
    pub acked: Mutex<Vec<Bytes>>,
    /// Number of `fetch` calls.
    pub fetches: AtomicUsize,
}

impl VecSource {
    /// A partition pre-filled with `messages`.
    pub fn with(messages: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            pending: Mutex::new(messages.into_iter().map(Bytes::from).collect()),
            ..Self::default()
        }
    }

    /// Number of acknowledged messages.
    pub fn acked_count(&self) -> usize {
        self.acked.lock().unwrap().len()
    }
}

impl MessageSource for VecSource {
    fn name(&self) -> &str {
        "test-partition"
    }

    fn fetch(&self) -> BoxFuture<'_, CallResult<Option<Delivery>>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let head = self.pending.lock().unwrap().front().cloned();
        Box::pin(async move { Ok(head.map(|payload| Delivery { payload })) })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, CallResult<()>> {
        let mut pending = self.pending.lock().unwrap();
        if pending.front() == Some(&delivery.payload) {
            pending.pop_front();
        }
        self.acked.lock().unwrap().push(delivery.payload.clone());
        Box::pin(async { Ok(()) })
    }
}

/// Node probe answering from a table; unknown nodes are unreachable.
#[derive(Default)]
pub struct ScriptedProbe {
    nodes: Mutex<HashMap<String, (u64, u64)>>,
}

impl ScriptedProbe {
    /// Sets the `(used, available)` reading of `node`.
    pub fn set(&self, node: &str, used: u64, available: u64) {
        self.nodes.lock().unwrap().insert(node.to_string(), (used, available));
    }
}

impl NodeProbe for ScriptedProbe {
    fn memory<'a>(&'a self, node: &'a str) -> BoxFuture<'a, CallResult<MemoryUsage>> {
        let found = self.nodes.lock().unwrap().get(node).copied();
        Box::pin(async move {
            found
                .map(|(used, available)| MemoryUsage::new(node, used, available))
                .ok_or_else(|| CollaboratorError::Unavailable(node.to_string()))
        })
    }
}

/// A fully wired pipeline over the fakes above.
pub struct Pipeline {
    /// Shared cache behind dedup, attachments and user reports.
    pub cache: Arc<FaultyCache>,
    /// Processing store.
    pub store: Arc<RecordingStore>,
    /// Downstream task queue.
    pub tasks: Arc<RecordingTasks>,
    /// Usage accountant.
    pub usage: Arc<RecordingUsage>,
    /// Metrics sink.
    pub metrics: Arc<RecordingMetrics>,
    /// Live killswitch rules.
    pub killswitches: KillswitchStore,
    /// The dispatcher.
    pub dispatcher: Arc<IngestDispatcher>,
    /// The consumer routing raw broker payloads.
    pub consumer: Arc<IngestConsumer>,
    /// Subscription to accepted events, taken before any dispatch.
    pub accepted: broadcast::Receiver<AcceptedEvent>,
}

impl Pipeline {
    /// A pipeline knowing [`project`] 7 and [`project`] 42.
    pub fn new() -> Self {
        Self::with_projects(vec![project(7, OrganizationFeatures::default()), project(42, OrganizationFeatures::default())])
    }

    /// A pipeline knowing the given projects.
    pub fn with_projects(projects: Vec<Project>) -> Self {
        let cache = Arc::new(FaultyCache::default());
        let store = Arc::new(RecordingStore::default());
        let tasks = Arc::new(RecordingTasks::default());
        let usage = Arc::new(RecordingUsage::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let killswitches = KillswitchStore::default();

        let deps = DispatcherDeps {
            dedup: DedupGuard::new(cache.clone(), DEDUP_TTL, TIMEOUT),
            killswitches: killswitches.clone(),
            processing_store: store.clone(),
            attachments: AttachmentCache::new(cache.clone(), DEDUP_TTL, TIMEOUT),
            tasks: tasks.clone(),
            usage: usage.clone(),
            metrics: metrics.clone(),
        };
        let options = DispatcherOptions {
            operation_timeout: TIMEOUT,
            ..DispatcherOptions::default()
        };
        let dispatcher = Arc::new(IngestDispatcher::new(deps, options));
        let accepted = dispatcher.subscribe();

        let assembler = ChunkAssembler::new(
            AttachmentCache::new(cache.clone(), DEDUP_TTL, TIMEOUT),
            Arc::new(NoEventLookup),
            Arc::new(CacheAttachmentStore::new(cache.clone(), DEDUP_TTL)),
            killswitches.clone(),
            TIMEOUT,
        );
        let reports = UserReportProcessor::new(Arc::new(CacheUserReportStore::new(cache.clone(), DEDUP_TTL)), TIMEOUT);
        let consumer = Arc::new(IngestConsumer::new(
            Arc::new(StaticProjectResolver::new(projects)),
            dispatcher.clone(),
            Arc::new(assembler),
            Arc::new(reports),
            TIMEOUT,
        ));

        Self {
            cache,
            store,
            tasks,
            usage,
            metrics,
            killswitches,
            dispatcher,
            consumer,
            accepted,
        }
    }

    /// Number of dedup records currently held.
    pub fn dedup_records(&self) -> usize {
        self.cache.inner.keys_with_prefix("ev:").len()
    }

    /// The attachment cache over the shared cache, for reading back what the
    /// pipeline cached.
    pub fn attachment_cache(&self) -> AttachmentCache {
        AttachmentCache::new(self.cache.clone(), DEDUP_TTL, TIMEOUT)
    }

    /// Drains the accepted-event subscription.
    pub fn drain_accepted(&mut self) -> Vec<AcceptedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.accepted.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// A project of organization 3 (`"acme"`).
pub fn project(id: u64, features: OrganizationFeatures) -> Project {
    Project {
        id,
        organization_id: 3,
        organization_slug: "acme".to_string(),
        features,
    }
}

/// An event envelope without attachments.
pub fn event(event_id: &str, project_id: u64, payload: &str) -> IngestMessage {
    IngestMessage {
        event_id: event_id.to_string(),
        project_id,
        payload: Bytes::from(payload.to_string()),
        start_time: 1_700_000_000.0,
        remote_addr: Some("192.0.2.10".to_string()),
        attachments: Vec::new(),
    }
}

/// Encodes a broker message for a partition.
pub fn encode(message: BrokerMessage) -> Vec<u8> {
    message.encode().expect("broker message encodes")
}
