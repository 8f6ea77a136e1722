//! # Bounded Calls and Non-Critical Effects
//!
//! Two wrappers govern every await on a collaborator:
//!
//! - [`bounded`] puts a deadline on a correctness-bearing call (cache,
//!   processing store, task queue). An elapsed deadline becomes
//!   [`CollaboratorError::Timeout`], which the dispatcher surfaces as
//!   retriable, so one slow dependency cannot stall a partition.
//! - [`isolate_panics`] wraps a whole message handler so a panicking
//!   collaborator becomes a retriable failure instead of killing the
//!   partition worker.
//! - [`NonCritical`] runs observability side effects (usage accounting,
//!   metrics, accepted notifications). It bounds them the same way, then
//!   logs and discards errors, timeouts and panics. Its return type carries
//!   no error, so a call site cannot accidentally make such an effect
//!   correctness-bearing.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::error::{CollaboratorError, IngestError};

/// Awaits `fut` for at most `limit`.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout {
            operation,
            elapsed: limit,
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Runs a message handler, turning a panic into [`IngestError::Retriable`].
pub async fn isolate_panics<T, F>(operation: &'static str, fut: F) -> Result<T, IngestError>
where
    F: Future<Output = Result<T, IngestError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(operation, panic = reason, "handler panicked");
            Err(IngestError::Retriable(CollaboratorError::Unavailable(format!(
                "{} panicked: {}",
                operation, reason
            ))))
        }
    }
}

/// Runner for best-effort side effects.
#[derive(Debug, Clone, Copy)]
pub struct NonCritical {
    limit: Duration,
}

impl NonCritical {
    /// Creates a runner that gives each effect at most `limit`.
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// Runs one effect. Returns its value on success and `None` on any
    /// failure, timeout or panic.
    pub async fn run<T, E, F>(&self, effect: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match tokio::time::timeout(self.limit, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(Ok(value))) => Some(value),
            Ok(Ok(Err(e))) => {
                debug!(effect, error = %e, "non-critical effect failed");
                None
            }
            Ok(Err(_)) => {
                warn!(effect, "non-critical effect panicked");
                None
            }
            Err(_) => {
                warn!(effect, limit_ms = self.limit.as_millis() as u64, "non-critical effect timed out");
                None
            }
        }
    }
}
