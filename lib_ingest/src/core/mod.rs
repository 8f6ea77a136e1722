//! # Ingestion Core
//!
//! The per-message path of the pipeline. Each broker partition is served by
//! one worker that feeds raw messages to the [`IngestConsumer`], which routes
//! them to the component responsible for their kind.
//!
//! ## Core Components:
//!
//! - **`dispatcher`**: The event entry point. Deduplicates, gates, decodes,
//!   persists and routes one event envelope to its downstream task.
//!
//! - **`dedup`**: The approximate duplicate guard. A short-TTL cache record
//!   per `(project_id, event_id)`, written only after a full dispatch.
//!
//! - **`killswitch`**: The load-shed gate. Operator rules evaluated against a
//!   typed context; the live snapshot is read on every evaluation.
//!
//! - **`chunks`**: The attachment cache and chunk assembler for attachments
//!   uploaded in fragments.
//!
//! - **`userreport`**: The standalone feedback path, which reports its result
//!   as a boolean and never asks for redelivery.
//!
//! - **`consumer`**: Envelope decoding, project resolution and the partition
//!   worker loop with retry backoff.
//!
//! - **`effects`**: The deadline wrapper for collaborator calls and the
//!   non-critical effect runner.

/// Deadline wrapper and best-effort effect runner.
pub mod effects;
/// Approximate duplicate guard.
pub mod dedup;
/// Operator killswitch rules.
pub mod killswitch;
/// Attachment cache and chunk reassembly.
pub mod chunks;
/// Standalone user feedback path.
pub mod userreport;
/// Event dispatch.
pub mod dispatcher;
/// Envelope handling and the partition worker.
pub mod consumer;

// --- Public API Re-exports ---
pub use chunks::{AttachmentCache, AttachmentOutcome, ChunkAssembler};
pub use consumer::{run_partition, Delivery, HandleOutcome, IngestConsumer, MessageSource, RetryBackoff};
pub use dedup::{DedupGuard, DedupStatus, DEDUP_TTL};
pub use dispatcher::{DispatchOutcome, DispatcherDeps, DispatcherOptions, IngestDispatcher};
pub use effects::NonCritical;
pub use killswitch::{
    ContextField, KillswitchConfig, KillswitchContext, KillswitchStore, Pattern, Predicate, LOAD_SHED_PARSED_PIPELINE,
    LOAD_SHED_PIPELINE,
};
pub use userreport::{CacheUserReportStore, FeedbackCreationSource, UserReport, UserReportProcessor, UserReportStore};
