//! # Ingestion Dispatcher
//!
//! The per-event entry point. [`IngestDispatcher::process_event`] takes one
//! event envelope and its resolved project and either completes every
//! required side effect, returns early having done nothing (duplicate, shed,
//! not stuck), or fails with [`IngestError::Retriable`] so the caller leaves
//! the message unacknowledged.
//!
//! ## Pipeline:
//!
//! 1. Required fields are present (fatal otherwise).
//! 2. Dedup check. A cache failure is retriable, never "not seen".
//! 3. Pre-parse killswitch on project, event id and attachment presence.
//! 4. Payload decode. Corrupt input is fatal.
//! 5. Post-parse killswitch, adding organization and event type.
//! 6. Processing store write, yielding the `cache_key`.
//! 7. Usage accounting (best-effort).
//! 8. Attachment descriptors cached under the `cache_key`.
//! 9. Routing to the downstream task by event type.
//! 10. Dedup record, then the accepted notification (best-effort).
//!
//! Every collaborator failure from step 2 on is retriable: losing an event
//! silently is worse than processing it twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::collaborators::{MetricsSink, ProcessingStore, TaskQueue, UsageAccountant, UsageUnit};
use crate::core::chunks::AttachmentCache;
use crate::core::dedup::{DedupGuard, DedupStatus};
use crate::core::effects::{bounded, isolate_panics, NonCritical};
use crate::core::killswitch::{KillswitchContext, KillswitchStore, LOAD_SHED_PARSED_PIPELINE, LOAD_SHED_PIPELINE};
use crate::error::IngestError;
use crate::model::{
    AcceptedEvent, CacheKey, DownstreamTask, EventData, IngestMessage, Project, TaskArgs, TaskKind,
};

/// Counter for events of the internal project before decoding.
pub const INTERNAL_UNPARSED_METRIC: &str = "internal.captured.ingest_consumer.unparsed";
/// Counter for events of the internal project after decoding.
pub const INTERNAL_PARSED_METRIC: &str = "internal.captured.ingest_consumer.parsed";
/// Spans reported for organizations without sampling.
pub const UNSAMPLED_SPANS_METRIC: &str = "event.save_event.unsampled.spans.count";
/// Attachments cached with their event, tagged by declared type.
pub const ATTACHMENTS_CACHED_METRIC: &str = "ingest_consumer.attachments.cached";

/// What `process_event` did with a message. Every variant consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to a downstream task.
    Dispatched(TaskKind),
    /// Dispatched recently; nothing was done.
    Duplicate,
    /// Dropped by a killswitch.
    Shed,
    /// A feedback event for an organization without feedback ingestion.
    FeedbackNotEntitled,
    /// Reprocess-only-stuck mode and the event is not in the processing store.
    NotStuck,
}

/// Collaborators used by the dispatcher.
#[derive(Clone)]
pub struct DispatcherDeps {
    /// Duplicate guard.
    pub dedup: DedupGuard,
    /// Live killswitch rules.
    pub killswitches: KillswitchStore,
    /// Holds decoded events for downstream tasks.
    pub processing_store: Arc<dyn ProcessingStore>,
    /// Caches attachment descriptors with their event.
    pub attachments: AttachmentCache,
    /// Downstream task queue.
    pub tasks: Arc<dyn TaskQueue>,
    /// Usage accounting sink.
    pub usage: Arc<dyn UsageAccountant>,
    /// Metrics sink.
    pub metrics: Arc<dyn MetricsSink>,
}

/// Tunables of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Budget of each collaborator call.
    pub operation_timeout: Duration,
    /// Only process events already held by the processing store.
    pub reprocess_only_stuck_events: bool,
    /// The system's own project, whose events get extra counters.
    pub internal_project_id: Option<u64>,
    /// Resource name used for usage accounting.
    pub processing_store_name: String,
    /// Buffer of the accepted-event broadcast channel.
    pub notification_capacity: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            reprocess_only_stuck_events: false,
            internal_project_id: None,
            processing_store_name: "processing_store".to_string(),
            notification_capacity: 1024,
        }
    }
}

/// # Ingestion Dispatcher
///
/// Shared by all partition workers; holds no per-message state.
pub struct IngestDispatcher {
    deps: DispatcherDeps,
    options: DispatcherOptions,
    effects: NonCritical,
    accepted_tx: broadcast::Sender<AcceptedEvent>,
}

impl IngestDispatcher {
    /// Creates the dispatcher and its accepted-event channel.
    pub fn new(deps: DispatcherDeps, options: DispatcherOptions) -> Self {
        let (accepted_tx, _) = broadcast::channel(options.notification_capacity.max(1));
        Self {
            effects: NonCritical::new(options.operation_timeout),
            deps,
            options,
            accepted_tx,
        }
    }

    /// Subscribes to accepted-event notifications. Slow subscribers lag and
    /// lose notifications; dispatch never waits for them.
    pub fn subscribe(&self) -> broadcast::Receiver<AcceptedEvent> {
        self.accepted_tx.subscribe()
    }

    /// Processes one event envelope. A panic in any collaborator is reported
    /// as [`IngestError::Retriable`].
    pub async fn process_event(
        &self,
        message: &IngestMessage,
        project: &Project,
    ) -> Result<DispatchOutcome, IngestError> {
        isolate_panics("process_event", self.dispatch(message, project)).await
    }

    async fn dispatch(&self, message: &IngestMessage, project: &Project) -> Result<DispatchOutcome, IngestError> {
        // --- Phase 1: required fields ---
        let event_id = message.event_id.as_str();
        if event_id.trim().is_empty() {
            return Err(IngestError::Malformed("empty `event_id`".to_string()));
        }
        let project_id = message.project_id;
        let has_attachments = !message.attachments.is_empty();
        let is_internal = self.options.internal_project_id == Some(project_id);

        if is_internal {
            self.incr(INTERNAL_UNPARSED_METRIC, 1, &[]).await;
        }

        // --- Phase 2: dedup ---
        if self.deps.dedup.check(project_id, event_id).await? == DedupStatus::SeenRecently {
            warn!(event_id, project_id, "duplicated event detected");
            return Ok(DispatchOutcome::Duplicate);
        }

        // --- Phase 3: pre-parse gate ---
        let ctx = KillswitchContext::pre_parse(project_id, event_id, has_attachments);
        if self.deps.killswitches.matches(LOAD_SHED_PIPELINE, &ctx) {
            return Ok(DispatchOutcome::Shed);
        }

        // --- Phase 4: decode ---
        let data = Arc::new(EventData::decode(&message.payload)?);
        let event_type = data.event_type_tag().to_string();

        if is_internal {
            self.incr(INTERNAL_PARSED_METRIC, 1, &[("event_type", event_type.clone())])
                .await;
        }

        // --- Phase 5: post-parse gate ---
        let ctx = KillswitchContext::post_parse(
            project.organization_id,
            project.id,
            &event_type,
            has_attachments,
            event_id,
        );
        if self.deps.killswitches.matches(LOAD_SHED_PARSED_PIPELINE, &ctx) {
            return Ok(DispatchOutcome::Shed);
        }

        let timeout = self.options.operation_timeout;

        if self.options.reprocess_only_stuck_events {
            let stuck = bounded(
                "processing_store.exists",
                timeout,
                self.deps.processing_store.exists(project_id, event_id),
            )
            .await?;
            if !stuck {
                debug!(event_id, project_id, "event not in processing store, skipping");
                return Ok(DispatchOutcome::NotStuck);
            }
        }

        // --- Phase 6: processing store ---
        let cache_key = bounded(
            "processing_store.store",
            timeout,
            self.deps.processing_store.store(project_id, event_id, &data),
        )
        .await?;

        // --- Phase 7: usage accounting ---
        let feature = match data.event_type() {
            Some("error") => Some("errors"),
            Some("transaction") => Some("transactions"),
            _ => None,
        };
        if let Some(feature) = feature {
            let resource = self.options.processing_store_name.as_str();
            let amount = message.payload.len() as u64;
            self.effects
                .run(
                    "usage.record",
                    self.deps.usage.record(resource, feature, amount, UsageUnit::Bytes),
                )
                .await;
        }

        // --- Phase 8: attachments ---
        if has_attachments {
            self.deps.attachments.set(&cache_key, &message.attachments).await?;
            for attachment in &message.attachments {
                self.incr(
                    ATTACHMENTS_CACHED_METRIC,
                    1,
                    &[("attachment_type", attachment.attachment_type.clone())],
                )
                .await;
            }
        }

        // --- Phase 9: routing ---
        let outcome = match data.event_type() {
            Some("transaction") => {
                let args = self.task_args(message, Some(cache_key), None, has_attachments);
                self.enqueue(TaskKind::SaveEventTransaction, args).await?;
                self.record_span_metric(project, &data).await;
                DispatchOutcome::Dispatched(TaskKind::SaveEventTransaction)
            }
            Some("feedback") => {
                if project.features.user_feedback_ingest {
                    let args = self.task_args(message, None, Some(data.clone()), has_attachments);
                    self.enqueue(TaskKind::SaveEventFeedback, args).await?;
                    DispatchOutcome::Dispatched(TaskKind::SaveEventFeedback)
                } else {
                    debug!(event_id, project_id, "feedback ingestion not enabled, dropping");
                    DispatchOutcome::FeedbackNotEntitled
                }
            }
            _ => {
                let args = self.task_args(message, Some(cache_key), Some(data.clone()), has_attachments);
                self.enqueue(TaskKind::PreprocessEvent, args).await?;
                DispatchOutcome::Dispatched(TaskKind::PreprocessEvent)
            }
        };

        // --- Phase 10: dedup record and notification ---
        self.deps.dedup.remember(project_id, event_id).await?;

        let accepted = AcceptedEvent {
            remote_addr: message.remote_addr.clone(),
            data,
            project: project.clone(),
            accepted_at: Utc::now(),
        };
        let tx = &self.accepted_tx;
        self.effects
            .run("event_accepted", async move { tx.send(accepted).map(|_| ()) })
            .await;

        Ok(outcome)
    }

    fn task_args(
        &self,
        message: &IngestMessage,
        cache_key: Option<CacheKey>,
        data: Option<Arc<EventData>>,
        has_attachments: bool,
    ) -> TaskArgs {
        TaskArgs {
            cache_key,
            data,
            start_time: message.start_time,
            event_id: message.event_id.clone(),
            project_id: message.project_id,
            has_attachments,
        }
    }

    async fn enqueue(&self, kind: TaskKind, args: TaskArgs) -> Result<(), IngestError> {
        let task = DownstreamTask { kind, args };
        bounded("tasks.enqueue", self.options.operation_timeout, self.deps.tasks.enqueue(task)).await?;
        Ok(())
    }

    async fn record_span_metric(&self, project: &Project, data: &EventData) {
        let features = &project.features;
        if features.dynamic_sampling || features.am3_tier {
            return;
        }
        let amount = data.span_count() as u64 + 1;
        self.incr(
            UNSAMPLED_SPANS_METRIC,
            amount,
            &[("organization", project.organization_slug.clone())],
        )
        .await;
    }

    async fn incr(&self, key: &'static str, amount: u64, tags: &[(&'static str, String)]) {
        self.effects.run(key, self.deps.metrics.incr(key, amount, tags)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use tokio::sync::mpsc;

    use crate::collaborators::{CacheProcessingStore, CallResult, ChannelTaskQueue, TracingUsageAccountant};
    use crate::connections::cache_memory::InMemoryCache;
    use crate::core::dedup::DEDUP_TTL;
    use crate::model::{AttachmentDescriptor, OrganizationFeatures};

    #[derive(Default)]
    struct RecordingMetrics {
        calls: Mutex<Vec<(String, u64, Vec<(&'static str, String)>)>>,
    }

    impl RecordingMetrics {
        fn named(&self, key: &str) -> Vec<(u64, Vec<(&'static str, String)>)> {
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
        fn incr<'a>(
            &'a self,
            key: &'a str,
            amount: u64,
            tags: &'a [(&'static str, String)],
        ) -> BoxFuture<'a, CallResult<()>> {
            self.calls
                .lock()
                .unwrap()
                .push((key.to_string(), amount, tags.to_vec()));
            Box::pin(async { Ok(()) })
        }
    }

    struct Harness {
        dispatcher: IngestDispatcher,
        tasks: mpsc::Receiver<DownstreamTask>,
        metrics: Arc<RecordingMetrics>,
        cache: Arc<InMemoryCache>,
    }

    struct PanickingStore;

    impl ProcessingStore for PanickingStore {
        fn store<'a>(
            &'a self,
            _project_id: u64,
            _event_id: &'a str,
            _data: &'a EventData,
        ) -> BoxFuture<'a, CallResult<CacheKey>> {
            panic!("processing store bug");
        }

        fn exists<'a>(&'a self, _project_id: u64, _event_id: &'a str) -> BoxFuture<'a, CallResult<bool>> {
            Box::pin(async { Ok(true) })
        }
    }

    fn harness(options: DispatcherOptions) -> Harness {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(CacheProcessingStore::new(cache.clone(), DEDUP_TTL));
        harness_with_store(options, cache, store)
    }

    fn harness_with_store(
        options: DispatcherOptions,
        cache: Arc<InMemoryCache>,
        processing_store: Arc<dyn ProcessingStore>,
    ) -> Harness {
        let timeout = Duration::from_secs(1);
        let (queue, tasks) = ChannelTaskQueue::new(16);
        let metrics = Arc::new(RecordingMetrics::default());
        let deps = DispatcherDeps {
            dedup: DedupGuard::new(cache.clone(), DEDUP_TTL, timeout),
            killswitches: KillswitchStore::default(),
            processing_store,
            attachments: AttachmentCache::new(cache.clone(), DEDUP_TTL, timeout),
            tasks: Arc::new(queue),
            usage: Arc::new(TracingUsageAccountant),
            metrics: metrics.clone(),
        };
        Harness {
            dispatcher: IngestDispatcher::new(deps, options),
            tasks,
            metrics,
            cache,
        }
    }

    fn project(features: OrganizationFeatures) -> Project {
        Project {
            id: 7,
            organization_id: 3,
            organization_slug: "acme".into(),
            features,
        }
    }

    fn message(event_id: &str, payload: &str) -> IngestMessage {
        IngestMessage {
            event_id: event_id.into(),
            project_id: 7,
            payload: Bytes::from(payload.to_string()),
            start_time: 1_700_000_000.0,
            remote_addr: Some("127.0.0.1".into()),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn transactions_skip_preprocessing_and_report_spans() {
        let mut h = harness(DispatcherOptions::default());
        let msg = message("t1", r#"{"type":"transaction","spans":[{},{},{}]}"#);

        let outcome = h
            .dispatcher
            .process_event(&msg, &project(OrganizationFeatures::default()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::SaveEventTransaction));

        let task = h.tasks.try_recv().unwrap();
        assert_eq!(task.kind, TaskKind::SaveEventTransaction);
        assert!(task.args.cache_key.is_some());
        assert!(task.args.data.is_none());
        assert!(h.tasks.try_recv().is_err());

        let spans = h.metrics.named(UNSAMPLED_SPANS_METRIC);
        assert_eq!(spans, vec![(4, vec![("organization", "acme".to_string())])]);
    }

    #[tokio::test]
    async fn sampled_organizations_do_not_report_spans() {
        let h = harness(DispatcherOptions::default());
        let features = OrganizationFeatures {
            dynamic_sampling: true,
            ..OrganizationFeatures::default()
        };
        h.dispatcher
            .process_event(&message("t1", r#"{"type":"transaction"}"#), &project(features))
            .await
            .unwrap();
        assert!(h.metrics.named(UNSAMPLED_SPANS_METRIC).is_empty());
    }

    #[tokio::test]
    async fn feedback_requires_entitlement() {
        let mut h = harness(DispatcherOptions::default());
        let msg = message("f1", r#"{"type":"feedback"}"#);

        let outcome = h
            .dispatcher
            .process_event(&msg, &project(OrganizationFeatures::default()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::FeedbackNotEntitled);
        assert!(h.tasks.try_recv().is_err());

        let entitled = OrganizationFeatures {
            user_feedback_ingest: true,
            ..OrganizationFeatures::default()
        };
        let outcome = h
            .dispatcher
            .process_event(&message("f2", r#"{"type":"feedback"}"#), &project(entitled))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::SaveEventFeedback));
        let task = h.tasks.try_recv().unwrap();
        assert!(task.args.cache_key.is_none());
        assert!(task.args.data.is_some());
    }

    #[tokio::test]
    async fn corrupt_payloads_are_fatal() {
        let h = harness(DispatcherOptions::default());
        let err = h
            .dispatcher
            .process_event(&message("e1", "{nope"), &project(OrganizationFeatures::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
        assert!(h.cache.keys_with_prefix("ev:").is_empty());
    }

    #[tokio::test]
    async fn reprocess_only_stuck_skips_unknown_events() {
        let mut h = harness(DispatcherOptions {
            reprocess_only_stuck_events: true,
            ..DispatcherOptions::default()
        });
        let proj = project(OrganizationFeatures::default());

        let outcome = h
            .dispatcher
            .process_event(&message("e1", r#"{"type":"error"}"#), &proj)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NotStuck);
        assert!(h.tasks.try_recv().is_err());

        let stuck = EventData::decode(br#"{"type":"error"}"#).unwrap();
        CacheProcessingStore::new(h.cache.clone(), DEDUP_TTL)
            .store(7, "e2", &stuck)
            .await
            .unwrap();
        let outcome = h
            .dispatcher
            .process_event(&message("e2", r#"{"type":"error"}"#), &proj)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::PreprocessEvent));
    }

    #[tokio::test]
    async fn internal_project_gets_extra_counters() {
        let h = harness(DispatcherOptions {
            internal_project_id: Some(7),
            ..DispatcherOptions::default()
        });
        h.dispatcher
            .process_event(&message("e1", "{}"), &project(OrganizationFeatures::default()))
            .await
            .unwrap();

        assert_eq!(h.metrics.named(INTERNAL_UNPARSED_METRIC).len(), 1);
        assert_eq!(
            h.metrics.named(INTERNAL_PARSED_METRIC),
            vec![(1, vec![("event_type", "null".to_string())])]
        );
    }

    fn descriptor(id: &str, attachment_type: &str) -> AttachmentDescriptor {
        AttachmentDescriptor {
            attachment_type: attachment_type.into(),
            id: id.into(),
            name: format!("{}.bin", id),
            content_type: None,
            chunks: 2,
            data: None,
            size: Some(10),
        }
    }

    #[tokio::test]
    async fn attachment_descriptors_are_cached_with_the_event() {
        let mut h = harness(DispatcherOptions::default());
        let mut msg = message("e1", r#"{"type":"error"}"#);
        msg.attachments = vec![descriptor("a1", "event.attachment"), descriptor("a2", "event.minidump")];

        h.dispatcher
            .process_event(&msg, &project(OrganizationFeatures::default()))
            .await
            .unwrap();

        let cache_key = CacheKey::for_event(7, "e1");
        let cached = AttachmentCache::new(h.cache.clone(), DEDUP_TTL, Duration::from_secs(1))
            .get(&cache_key)
            .await
            .unwrap();
        assert_eq!(cached, msg.attachments);
        assert_eq!(h.cache.keys_with_prefix("e:e1:7:a"), vec!["e:e1:7:a".to_string()]);

        let task = h.tasks.try_recv().unwrap();
        assert!(task.args.has_attachments);

        assert_eq!(
            h.metrics.named(ATTACHMENTS_CACHED_METRIC),
            vec![
                (1, vec![("attachment_type", "event.attachment".to_string())]),
                (1, vec![("attachment_type", "event.minidump".to_string())]),
            ]
        );
    }

    #[tokio::test]
    async fn events_without_attachments_cache_no_descriptors() {
        let mut h = harness(DispatcherOptions::default());
        h.dispatcher
            .process_event(&message("e1", r#"{"type":"error"}"#), &project(OrganizationFeatures::default()))
            .await
            .unwrap();

        assert!(!h.tasks.try_recv().unwrap().args.has_attachments);
        assert!(h.metrics.named(ATTACHMENTS_CACHED_METRIC).is_empty());
        let cached = AttachmentCache::new(h.cache.clone(), DEDUP_TTL, Duration::from_secs(1))
            .get(&CacheKey::for_event(7, "e1"))
            .await
            .unwrap();
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn panicking_store_is_retriable_and_not_remembered() {
        let cache = Arc::new(InMemoryCache::new());
        let mut h = harness_with_store(DispatcherOptions::default(), cache, Arc::new(PanickingStore));

        let err = h
            .dispatcher
            .process_event(&message("e1", r#"{"type":"error"}"#), &project(OrganizationFeatures::default()))
            .await
            .unwrap_err();

        assert!(err.is_retriable());
        assert!(h.tasks.try_recv().is_err());
        assert!(h.cache.keys_with_prefix("ev:").is_empty());
    }

    #[tokio::test]
    async fn event_ids_are_used_verbatim() {
        let mut h = harness(DispatcherOptions::default());
        let proj = project(OrganizationFeatures::default());

        h.dispatcher.process_event(&message("e1", "{}"), &proj).await.unwrap();
        let padded = h.dispatcher.process_event(&message(" e1", "{}"), &proj).await.unwrap();

        assert_eq!(padded, DispatchOutcome::Dispatched(TaskKind::PreprocessEvent));
        assert_eq!(h.tasks.try_recv().unwrap().args.event_id, "e1");
        let task = h.tasks.try_recv().unwrap();
        assert_eq!(task.args.event_id, " e1");
        assert_eq!(task.args.cache_key, Some(CacheKey::for_event(7, " e1")));
    }
}
