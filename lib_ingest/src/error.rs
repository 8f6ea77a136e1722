//! # Error Taxonomy
//!
//! Every failure in the ingestion path lands in one of four buckets, and the
//! bucket decides what happens to the broker message:
//!
//! - **Fatal** (`IngestError::Malformed`, `IngestError::ProjectUnavailable`):
//!   the message is acknowledged and dropped with an error log. Redelivery
//!   cannot fix corrupt input.
//! - **Retriable** (`IngestError::Retriable`): the message stays
//!   unacknowledged and the partition worker retries it.
//! - **Expected non-fatal**: shedding, missing entitlements, unknown
//!   attachment types and user-report conflicts are *outcomes*, not errors.
//! - **Best-effort**: failures of accounting, metrics and notifications never
//!   leave `core::effects::NonCritical`.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by an external collaborator (cache, processing store,
/// task queue, event lookup, ...).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The call did not complete within its time budget.
    #[error("{operation} timed out after {}ms", elapsed.as_millis())]
    Timeout {
        /// Name of the bounded operation.
        operation: &'static str,
        /// The budget that was exceeded.
        elapsed: Duration,
    },

    /// The collaborator could not be reached or refused the call.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The collaborator is throttling this caller.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// The write conflicts with data that already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A chunk needed for reassembly is not in the attachment cache.
    #[error("missing chunk {chunk_index} of attachment {id}")]
    MissingChunk {
        /// Attachment id inside the event.
        id: String,
        /// The first index that could not be found.
        chunk_index: u32,
    },

    /// A value could not be encoded or decoded on its way to or from storage.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error returned by the Redis driver.
    #[cfg(feature = "connections")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(e: serde_json::Error) -> Self {
        CollaboratorError::Serialization(e.to_string())
    }
}

/// Result of handling one broker message.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The message is structurally broken (missing required field,
    /// undecodable payload). Never retried.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The owning project could not be resolved. Never retried.
    #[error("project {project_id} could not be resolved: {source}")]
    ProjectUnavailable {
        /// Project id carried by the message.
        project_id: u64,
        /// Underlying resolver failure.
        #[source]
        source: CollaboratorError,
    },

    /// A transient dependency failure. The message must be redelivered.
    #[error("retriable failure: {0}")]
    Retriable(#[from] CollaboratorError),
}

impl IngestError {
    /// `true` when the caller should leave the message unacknowledged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, IngestError::Retriable(_))
    }
}

/// Errors raised while loading configuration or killswitch rules.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error while reading a configuration file.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The configuration document is not valid JSON for its schema.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A killswitch condition names a context field that does not exist.
    #[error("killswitch {switch}: unknown context field '{field}'")]
    UnknownField {
        /// Killswitch name.
        switch: String,
        /// Offending field name.
        field: String,
    },

    /// A killswitch rule or setting is structurally invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
