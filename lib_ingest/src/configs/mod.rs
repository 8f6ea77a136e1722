//! # Configuration Modules
//!
//! Configuration providers for the ingest binaries.

/// CLI, environment and JSON file configuration of the ingest pipeline.
pub mod config_ingest;

pub use config_ingest::{load_config, IngestConfig, Settings};
