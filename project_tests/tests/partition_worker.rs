//! The partition worker loop: ordering, retries, fatal drops and admission.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use lib_ingest::backpressure::{AdmissionMonitor, HealthPolicy, ServiceDefinition};
use lib_ingest::core::{run_partition, MessageSource, RetryBackoff};
use lib_ingest::BrokerMessage;
use project_tests::{encode, event, Pipeline, ScriptedProbe, VecSource};

fn error_event(id: &str) -> Vec<u8> {
    encode(BrokerMessage::Event(event(id, 7, r#"{"type":"error"}"#)))
}

async fn wait_for(source: &VecSource, acked: usize) {
    while source.acked_count() < acked {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn retriable_failures_retry_the_same_message_in_order() {
    let pipeline = Pipeline::new();
    pipeline.tasks.fail_next.store(2, Ordering::SeqCst);
    let source = Arc::new(VecSource::with([error_event("e1"), error_event("e2")]));
    let token = CancellationToken::new();

    let worker = tokio::spawn(run_partition(
        source.clone() as Arc<dyn MessageSource>,
        pipeline.consumer.clone(),
        None,
        token.clone(),
        RetryBackoff::default(),
    ));

    wait_for(&source, 2).await;
    token.cancel();
    assert_eq!(worker.await.unwrap(), 2);

    assert_eq!(pipeline.tasks.event_ids(), vec!["e1", "e2"]);
    let acked = source.acked.lock().unwrap().clone();
    assert_eq!(acked, vec![error_event("e1"), error_event("e2")]);
}

#[tokio::test(start_paused = true)]
async fn a_panicking_collaborator_does_not_stop_the_partition() {
    let pipeline = Pipeline::new();
    pipeline.store.panic_next.store(1, Ordering::SeqCst);
    let source = Arc::new(VecSource::with([error_event("e1"), error_event("e2")]));
    let token = CancellationToken::new();

    let worker = tokio::spawn(run_partition(
        source.clone() as Arc<dyn MessageSource>,
        pipeline.consumer.clone(),
        None,
        token.clone(),
        RetryBackoff::default(),
    ));

    wait_for(&source, 2).await;
    token.cancel();
    assert_eq!(worker.await.unwrap(), 2);
    assert_eq!(pipeline.tasks.event_ids(), vec!["e1", "e2"]);
}

#[tokio::test(start_paused = true)]
async fn fatal_messages_are_acknowledged_and_skipped() {
    let pipeline = Pipeline::new();
    let source = Arc::new(VecSource::with([b"garbage".to_vec(), error_event("e1")]));
    let token = CancellationToken::new();

    let worker = tokio::spawn(run_partition(
        source.clone() as Arc<dyn MessageSource>,
        pipeline.consumer.clone(),
        None,
        token.clone(),
        RetryBackoff::default(),
    ));

    wait_for(&source, 2).await;
    token.cancel();
    assert_eq!(worker.await.unwrap(), 2);
    assert_eq!(pipeline.tasks.event_ids(), vec!["e1"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_retry_leaves_the_message_unacknowledged() {
    let pipeline = Pipeline::new();
    pipeline.tasks.fail_next.store(usize::MAX, Ordering::SeqCst);
    let source = Arc::new(VecSource::with([error_event("e1")]));
    let token = CancellationToken::new();

    let worker = tokio::spawn(run_partition(
        source.clone() as Arc<dyn MessageSource>,
        pipeline.consumer.clone(),
        None,
        token.clone(),
        RetryBackoff::default(),
    ));

    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();

    assert_eq!(worker.await.unwrap(), 0);
    assert_eq!(source.acked_count(), 0);
    assert_eq!(source.pending.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reads_pause_while_a_service_is_under_pressure() {
    let pipeline = Pipeline::new();
    let probe = Arc::new(ScriptedProbe::default());
    probe.set("redis://cache-1:6379", 950, 50);
    let (monitor, handle) = AdmissionMonitor::new(
        vec![ServiceDefinition {
            name: "cache".to_string(),
            nodes: vec!["redis://cache-1:6379".to_string()],
        }],
        probe.clone(),
        HealthPolicy::default(),
        Duration::from_millis(50),
    );
    monitor.poll_once().await;
    assert!(!handle.all_healthy());

    let source = Arc::new(VecSource::with([error_event("e1")]));
    let token = CancellationToken::new();
    let worker = tokio::spawn(run_partition(
        source.clone() as Arc<dyn MessageSource>,
        pipeline.consumer.clone(),
        Some(handle),
        token.clone(),
        RetryBackoff::default(),
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

    probe.set("redis://cache-1:6379", 100, 900);
    monitor.poll_once().await;
    wait_for(&source, 1).await;

    token.cancel();
    assert_eq!(worker.await.unwrap(), 1);
    assert_eq!(pipeline.tasks.event_ids(), vec!["e1"]);
}
