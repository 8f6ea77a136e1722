//! # User Report Processor
//!
//! Standalone feedback submitted against an event. This path reports its
//! result as a `bool` and never asks for redelivery: historical reports in
//! the broker are known to contain broken data, and retrying them only
//! stalls the partition.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::collaborators::{CacheBackend, CallResult};
use crate::core::effects::bounded;
use crate::error::CollaboratorError;
use crate::model::{Project, UserReportMessage};

/// A decoded user report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReport {
    /// Event the report refers to.
    pub event_id: String,
    /// Reporter name.
    #[serde(default)]
    pub name: String,
    /// Reporter e-mail.
    #[serde(default)]
    pub email: String,
    /// Free-form feedback.
    #[serde(default)]
    pub comments: String,
}

/// Where a piece of feedback entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCreationSource {
    /// A user report carried in an envelope.
    UserReportEnvelope,
}

/// Persists user reports.
pub trait UserReportStore: Send + Sync {
    /// Saves one report. A report that already exists for the same event
    /// fails with [`CollaboratorError::Conflict`].
    fn save<'a>(
        &'a self,
        project: &'a Project,
        report: &'a UserReport,
        source: FeedbackCreationSource,
        start_time: DateTime<Utc>,
    ) -> BoxFuture<'a, CallResult<()>>;
}

#[derive(Serialize)]
struct StoredReport<'a> {
    report: &'a UserReport,
    source: FeedbackCreationSource,
    start_time: DateTime<Utc>,
}

/// [`UserReportStore`] over a [`CacheBackend`]; one report per event.
pub struct CacheUserReportStore {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl CacheUserReportStore {
    /// Creates the store; reports expire after `ttl`.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }
}

impl UserReportStore for CacheUserReportStore {
    fn save<'a>(
        &'a self,
        project: &'a Project,
        report: &'a UserReport,
        source: FeedbackCreationSource,
        start_time: DateTime<Utc>,
    ) -> BoxFuture<'a, CallResult<()>> {
        Box::pin(async move {
            let key = format!("ur:{}:{}", project.id, report.event_id);
            let value = Bytes::from(serde_json::to_vec(&StoredReport {
                report,
                source,
                start_time,
            })?);
            if self.backend.set_if_absent(&key, value, self.ttl).await? {
                Ok(())
            } else {
                Err(CollaboratorError::Conflict(format!(
                    "a report for event {} already exists",
                    report.event_id
                )))
            }
        })
    }
}

/// Decodes and persists user reports.
pub struct UserReportProcessor {
    store: Arc<dyn UserReportStore>,
    timeout: Duration,
}

impl UserReportProcessor {
    /// Creates the processor.
    pub fn new(store: Arc<dyn UserReportStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// `true` when the report was stored. Conflicts are logged at info,
    /// everything else at error; neither is propagated.
    pub async fn process_userreport(&self, message: &UserReportMessage, project: &Project) -> bool {
        let start_time = to_datetime(message.start_time);

        let report: UserReport = match serde_json::from_slice(&message.payload) {
            Ok(report) => report,
            Err(e) => {
                error!(project_id = project.id, error = %e, "user report failed to decode");
                return false;
            }
        };

        let save = self
            .store
            .save(project, &report, FeedbackCreationSource::UserReportEnvelope, start_time);
        match bounded("userreport.save", self.timeout, save).await {
            Ok(()) => true,
            Err(CollaboratorError::Conflict(reason)) => {
                info!(project_id = project.id, event_id = %report.event_id, %reason, "invalid userreport");
                false
            }
            Err(e) => {
                error!(project_id = project.id, event_id = %report.event_id, error = %e, "user report failed");
                false
            }
        }
    }
}

/// Unix seconds to a UTC timestamp; out-of-range values clamp to now.
fn to_datetime(seconds: f64) -> DateTime<Utc> {
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds.fract() * 1e9).round() as u32).min(999_999_999);
    Utc.timestamp_opt(whole, nanos).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::cache_memory::InMemoryCache;
    use crate::model::OrganizationFeatures;

    fn project() -> Project {
        Project {
            id: 7,
            organization_id: 1,
            organization_slug: "acme".into(),
            features: OrganizationFeatures::default(),
        }
    }

    fn message(payload: &'static str) -> UserReportMessage {
        UserReportMessage {
            project_id: 7,
            start_time: 1_700_000_000.5,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    fn processor() -> UserReportProcessor {
        let store = CacheUserReportStore::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60));
        UserReportProcessor::new(Arc::new(store), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn duplicate_reports_conflict() {
        let processor = processor();
        let msg = message(r#"{"event_id":"e1","name":"Ada","email":"ada@example.com","comments":"broke"}"#);

        assert!(processor.process_userreport(&msg, &project()).await);
        assert!(!processor.process_userreport(&msg, &project()).await);
    }

    #[tokio::test]
    async fn broken_payloads_are_swallowed() {
        let processor = processor();
        assert!(!processor.process_userreport(&message("{oops"), &project()).await);
        assert!(!processor.process_userreport(&message(r#"{"name":"x"}"#), &project()).await);
    }

    #[test]
    fn start_time_keeps_sub_second_precision() {
        let ts = to_datetime(1_700_000_000.25);
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 250);
    }
}
