//! # lib_ingest
//!
//! The ingestion and admission core of the event pipeline. Untrusted event
//! submissions arrive from a partitioned broker, are deduplicated, gated by
//! operator killswitches, persisted to a processing store and routed to the
//! downstream task queue by event kind. Chunked attachments are reassembled
//! on the side, and an independent monitor samples memory pressure on the
//! backing clusters so consumers can back off before the caches fall over.
//!
//! ## Module Map:
//!
//! - **`core`**: the per-message path (`dispatcher`, `dedup`, `killswitch`,
//!   `chunks`, `userreport`, `consumer`) plus the `effects` helpers that
//!   bound every network call and swallow best-effort side effects.
//! - **`backpressure`**: node memory readings and the `AdmissionMonitor`.
//! - **`connections`** *(feature)*: Redis implementations of the cache,
//!   task queue, broker partition and node probe seams.
//! - **`configs`** *(feature)*: CLI/env/file configuration for the binaries.
//! - **`loggers`** *(feature)*: console + rolling JSON file logging.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Error taxonomy shared by every component.
pub mod error;
/// Broker message shapes and the decoded event representation.
pub mod model;
/// Narrow interfaces to the external collaborators, plus simple backends.
pub mod collaborators;
/// The per-message ingestion path.
pub mod core;
/// Memory-pressure sampling of the backing clusters.
pub mod backpressure;
/// Connection-backed implementations of the collaborator seams.
pub mod connections;

/// Configuration loading for the ingest binaries.
#[cfg(feature = "configs")]
pub mod configs;
/// Console and file logging setup.
#[cfg(feature = "loggers")]
pub mod loggers;

// --- Public API Re-exports ---
pub use error::{CollaboratorError, ConfigError, IngestError};
pub use model::{
    AcceptedEvent, Attachment, AttachmentDescriptor, AttachmentType, BrokerMessage, CacheKey,
    ChunkMessage, AttachmentMessage, DownstreamTask, EventData, IngestMessage, OrganizationFeatures,
    Project, TaskArgs, TaskKind, UserReportMessage,
};
