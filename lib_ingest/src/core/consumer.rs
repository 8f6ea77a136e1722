//! # Ingest Consumer
//!
//! Turns raw broker payloads into calls on the dispatcher, the chunk
//! assembler and the user report processor, and drives one partition.
//!
//! ## Partition Worker
//!
//! [`run_partition`] serves one partition with strict ordering: it fetches a
//! message, handles it, and only moves on once the message is acknowledged.
//! A retriable failure keeps the same message and retries it after an
//! exponential backoff; a fatal failure is logged and acknowledged. While
//! the admission monitor reports an unhealthy service, the worker stops
//! fetching.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backpressure::MonitorHandle;
use crate::collaborators::{CallResult, ProjectResolver};
use crate::core::chunks::{AttachmentOutcome, ChunkAssembler};
use crate::core::dispatcher::{DispatchOutcome, IngestDispatcher};
use crate::core::effects::{bounded, isolate_panics};
use crate::core::userreport::UserReportProcessor;
use crate::error::{CollaboratorError, IngestError};
use crate::model::{BrokerMessage, Project};

/// What happened to one broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// An event envelope went through the dispatcher.
    Event(DispatchOutcome),
    /// An attachment chunk was cached.
    ChunkStored,
    /// An individual attachment was finalized.
    Attachment(AttachmentOutcome),
    /// A user report was processed; `false` when it was not stored.
    UserReport(bool),
}

/// # Ingest Consumer
///
/// Stateless router shared by all partition workers.
pub struct IngestConsumer {
    resolver: Arc<dyn ProjectResolver>,
    dispatcher: Arc<IngestDispatcher>,
    assembler: Arc<ChunkAssembler>,
    reports: Arc<UserReportProcessor>,
    timeout: Duration,
}

impl IngestConsumer {
    /// Creates the consumer.
    pub fn new(
        resolver: Arc<dyn ProjectResolver>,
        dispatcher: Arc<IngestDispatcher>,
        assembler: Arc<ChunkAssembler>,
        reports: Arc<UserReportProcessor>,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            dispatcher,
            assembler,
            reports,
            timeout,
        }
    }

    /// The dispatcher, e.g. to subscribe to accepted events.
    pub fn dispatcher(&self) -> &Arc<IngestDispatcher> {
        &self.dispatcher
    }

    /// Handles one raw broker payload. A panic while handling it is
    /// reported as [`IngestError::Retriable`].
    pub async fn handle(&self, raw: &[u8]) -> Result<HandleOutcome, IngestError> {
        isolate_panics("consumer.handle", self.route(raw)).await
    }

    async fn route(&self, raw: &[u8]) -> Result<HandleOutcome, IngestError> {
        match BrokerMessage::decode(raw)? {
            BrokerMessage::Event(message) => {
                let project = self.resolve(message.project_id).await?;
                let outcome = self.dispatcher.process_event(&message, &project).await?;
                Ok(HandleOutcome::Event(outcome))
            }
            BrokerMessage::AttachmentChunk(message) => {
                self.assembler.process_attachment_chunk(&message).await?;
                Ok(HandleOutcome::ChunkStored)
            }
            BrokerMessage::Attachment(message) => {
                let project = self.resolve(message.project_id).await?;
                let outcome = self.assembler.process_individual_attachment(&message, &project).await?;
                Ok(HandleOutcome::Attachment(outcome))
            }
            BrokerMessage::UserReport(message) => match self.resolve(message.project_id).await {
                Ok(project) => {
                    let stored = self.reports.process_userreport(&message, &project).await;
                    Ok(HandleOutcome::UserReport(stored))
                }
                Err(e) => {
                    warn!(project_id = message.project_id, error = %e, "dropping user report without project");
                    Ok(HandleOutcome::UserReport(false))
                }
            },
        }
    }

    /// Resolves the owning project. An unreachable resolver is transient;
    /// any other failure is fatal for the message.
    async fn resolve(&self, project_id: u64) -> Result<Project, IngestError> {
        match bounded("projects.resolve", self.timeout, self.resolver.resolve(project_id)).await {
            Ok(project) => Ok(project),
            Err(e @ (CollaboratorError::Timeout { .. } | CollaboratorError::Unavailable(_))) => {
                Err(IngestError::Retriable(e))
            }
            Err(source) => Err(IngestError::ProjectUnavailable { project_id, source }),
        }
    }
}

/// One message fetched from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Raw broker payload.
    pub payload: Bytes,
}

/// A partition of the broker.
pub trait MessageSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;
    /// Next unacknowledged message, `None` when the partition is drained.
    /// Repeated calls without `ack` may return later messages; the worker
    /// never does that.
    fn fetch(&self) -> BoxFuture<'_, CallResult<Option<Delivery>>>;
    /// Acknowledges a delivery so it is not redelivered.
    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, CallResult<()>>;
}

/// Exponential backoff between retries of the same message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Delay before the first retry; also the idle poll interval.
    pub base: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Sleeps unless cancelled first. Returns `false` on cancellation.
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Serves one partition until `token` is cancelled.
///
/// Returns the number of messages acknowledged.
pub async fn run_partition(
    source: Arc<dyn MessageSource>,
    consumer: Arc<IngestConsumer>,
    admission: Option<MonitorHandle>,
    token: CancellationToken,
    backoff: RetryBackoff,
) -> u64 {
    let partition = source.name().to_string();
    let mut acknowledged = 0u64;
    let mut paused = false;
    info!(%partition, "partition worker started");

    'fetch: loop {
        if token.is_cancelled() {
            break;
        }

        // --- Phase 1: admission ---
        if let Some(monitor) = &admission {
            if !monitor.all_healthy() {
                if !paused {
                    warn!(%partition, unhealthy = ?monitor.unhealthy_services(), "backing services under pressure, pausing reads");
                    paused = true;
                }
                if !pause(&token, backoff.base).await {
                    break;
                }
                continue;
            }
            if paused {
                info!(%partition, "backing services healthy, resuming reads");
                paused = false;
            }
        }

        // --- Phase 2: fetch ---
        let delivery = match source.fetch().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                if !pause(&token, backoff.base).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(%partition, error = %e, "fetch failed");
                if !pause(&token, backoff.max).await {
                    break;
                }
                continue;
            }
        };

        // --- Phase 3: handle, retrying the same message ---
        let mut attempt = 0u32;
        loop {
            match consumer.handle(&delivery.payload).await {
                Ok(outcome) => {
                    debug!(%partition, ?outcome, "message handled");
                    break;
                }
                Err(e) if e.is_retriable() => {
                    let delay = backoff.delay(attempt);
                    warn!(%partition, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retriable failure, retrying message");
                    attempt = attempt.saturating_add(1);
                    if !pause(&token, delay).await {
                        // Left unacknowledged; it is redelivered on restart.
                        break 'fetch;
                    }
                }
                Err(e) => {
                    error!(%partition, error = %e, "dropping message");
                    break;
                }
            }
        }

        // --- Phase 4: acknowledge ---
        match source.ack(&delivery).await {
            Ok(()) => acknowledged += 1,
            Err(e) => warn!(%partition, error = %e, "ack failed, message may be redelivered"),
        }
    }

    info!(%partition, acknowledged, "partition worker stopped");
    acknowledged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = RetryBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }
}
