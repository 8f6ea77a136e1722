//! Downstream routing by event type, plus the best-effort side effects.

use std::sync::atomic::Ordering;

use lib_ingest::core::dispatcher::ATTACHMENTS_CACHED_METRIC;
use lib_ingest::core::DispatchOutcome;
use lib_ingest::{AttachmentDescriptor, CacheKey, IngestError, OrganizationFeatures, TaskKind};
use project_tests::{event, project, Pipeline};

fn feedback_enabled() -> OrganizationFeatures {
    OrganizationFeatures {
        user_feedback_ingest: true,
        ..OrganizationFeatures::default()
    }
}

#[tokio::test]
async fn transactions_skip_preprocessing() {
    let pipeline = Pipeline::new();
    let outcome = pipeline
        .dispatcher
        .process_event(&event("t1", 7, r#"{"type":"transaction","spans":[{}]}"#), &project(7, Default::default()))
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::SaveEventTransaction));
    let tasks = pipeline.tasks.tasks.lock().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].args.cache_key, Some(CacheKey::for_event(7, "t1")));
    assert!(tasks[0].args.data.is_none());
}

#[tokio::test]
async fn feedback_travels_inline_when_entitled() {
    let pipeline = Pipeline::new();
    let outcome = pipeline
        .dispatcher
        .process_event(&event("f1", 7, r#"{"type":"feedback"}"#), &project(7, feedback_enabled()))
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::SaveEventFeedback));
    let tasks = pipeline.tasks.tasks.lock().unwrap();
    assert!(tasks[0].args.cache_key.is_none());
    assert_eq!(
        tasks[0].args.data.as_ref().and_then(|d| d.event_type()),
        Some("feedback")
    );
}

#[tokio::test]
async fn feedback_without_entitlement_is_dropped_but_remembered() {
    let pipeline = Pipeline::new();
    let message = event("f1", 7, r#"{"type":"feedback"}"#);
    let project = project(7, Default::default());

    let first = pipeline.dispatcher.process_event(&message, &project).await.unwrap();
    let replay = pipeline.dispatcher.process_event(&message, &project).await.unwrap();

    assert_eq!(first, DispatchOutcome::FeedbackNotEntitled);
    assert_eq!(replay, DispatchOutcome::Duplicate);
    assert!(pipeline.tasks.kinds().is_empty());
}

#[tokio::test]
async fn everything_else_is_preprocessed() {
    let pipeline = Pipeline::new();
    let project = project(7, Default::default());

    for (id, payload) in [("e1", r#"{"type":"error"}"#), ("e2", r#"{"type":"csp"}"#), ("e3", "{}")] {
        pipeline.dispatcher.process_event(&event(id, 7, payload), &project).await.unwrap();
    }

    assert_eq!(pipeline.tasks.kinds(), vec![TaskKind::PreprocessEvent; 3]);
    let tasks = pipeline.tasks.tasks.lock().unwrap();
    assert!(tasks.iter().all(|t| t.args.cache_key.is_some() && t.args.data.is_some()));
}

#[tokio::test]
async fn corrupt_payload_is_fatal() {
    let pipeline = Pipeline::new();
    let err = pipeline
        .dispatcher
        .process_event(&event("e1", 7, "{nope"), &project(7, Default::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Malformed(_)));
    assert!(!err.is_retriable());
    assert_eq!(pipeline.store.write_count(), 0);
}

#[tokio::test]
async fn enqueue_failure_is_retriable_and_not_remembered() {
    let pipeline = Pipeline::new();
    let project = project(7, Default::default());
    let message = event("e1", 7, r#"{"type":"error"}"#);
    pipeline.tasks.fail_next.store(1, Ordering::SeqCst);

    let err = pipeline.dispatcher.process_event(&message, &project).await.unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(pipeline.dedup_records(), 0);

    let retried = pipeline.dispatcher.process_event(&message, &project).await.unwrap();
    assert_eq!(retried, DispatchOutcome::Dispatched(TaskKind::PreprocessEvent));
    assert_eq!(pipeline.tasks.kinds().len(), 1);
}

#[tokio::test]
async fn usage_is_accounted_per_feature() {
    let pipeline = Pipeline::new();
    let project = project(7, Default::default());
    let error = r#"{"type":"error"}"#;

    pipeline.dispatcher.process_event(&event("e1", 7, error), &project).await.unwrap();
    pipeline
        .dispatcher
        .process_event(&event("t1", 7, r#"{"type":"transaction"}"#), &project)
        .await
        .unwrap();
    pipeline
        .dispatcher
        .process_event(&event("c1", 7, r#"{"type":"csp"}"#), &project)
        .await
        .unwrap();

    let records = pipeline.usage.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], ("processing_store".to_string(), "errors".to_string(), error.len() as u64));
    assert_eq!(records[1].1, "transactions");
}

#[tokio::test]
async fn accounting_failure_does_not_fail_dispatch() {
    let pipeline = Pipeline::new();
    pipeline.usage.fail.store(true, Ordering::SeqCst);

    let outcome = pipeline
        .dispatcher
        .process_event(&event("e1", 7, r#"{"type":"error"}"#), &project(7, Default::default()))
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::PreprocessEvent));
    assert_eq!(pipeline.dedup_records(), 1);
}

fn descriptor(id: &str, attachment_type: &str) -> AttachmentDescriptor {
    AttachmentDescriptor {
        attachment_type: attachment_type.to_string(),
        id: id.to_string(),
        name: format!("{}.dat", id),
        content_type: Some("application/octet-stream".to_string()),
        chunks: 3,
        data: None,
        size: Some(42),
    }
}

#[tokio::test]
async fn attachments_are_cached_under_the_event_key() {
    let pipeline = Pipeline::new();
    let mut message = event("e1", 7, r#"{"type":"transaction"}"#);
    message.attachments = vec![descriptor("a1", "event.attachment"), descriptor("a2", "event.view_hierarchy")];

    let outcome = pipeline
        .dispatcher
        .process_event(&message, &project(7, Default::default()))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Dispatched(TaskKind::SaveEventTransaction));

    let cache_key = CacheKey::for_event(7, "e1");
    let cached = pipeline.attachment_cache().get(&cache_key).await.unwrap();
    assert_eq!(cached, message.attachments);

    let tasks = pipeline.tasks.tasks.lock().unwrap();
    assert!(tasks[0].args.has_attachments);
    assert_eq!(tasks[0].args.cache_key, Some(cache_key));

    assert_eq!(
        pipeline.metrics.named(ATTACHMENTS_CACHED_METRIC),
        vec![
            (1, vec![("attachment_type", "event.attachment".to_string())]),
            (1, vec![("attachment_type", "event.view_hierarchy".to_string())]),
        ]
    );
}

#[tokio::test]
async fn attachment_cache_failure_is_retriable() {
    let pipeline = Pipeline::new();
    let mut message = event("e1", 7, r#"{"type":"error"}"#);
    message.attachments = vec![descriptor("a1", "event.attachment")];
    pipeline.cache.fail_writes.store(true, Ordering::SeqCst);

    let err = pipeline
        .dispatcher
        .process_event(&message, &project(7, Default::default()))
        .await
        .unwrap_err();

    assert!(err.is_retriable());
    assert!(pipeline.tasks.kinds().is_empty());
}

#[tokio::test]
async fn panicking_store_is_retriable() {
    let pipeline = Pipeline::new();
    let message = event("e1", 7, r#"{"type":"error"}"#);
    let project = project(7, Default::default());
    pipeline.store.panic_next.store(1, Ordering::SeqCst);

    let err = pipeline.dispatcher.process_event(&message, &project).await.unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(pipeline.dedup_records(), 0);

    let retried = pipeline.dispatcher.process_event(&message, &project).await.unwrap();
    assert_eq!(retried, DispatchOutcome::Dispatched(TaskKind::PreprocessEvent));
}
