//! # Backpressure
//!
//! Samples memory pressure on the clusters backing the caches and stores,
//! and publishes a health verdict per service.
//!
//! ## Core Components:
//!
//! - **`memory`**: Per-node [`MemoryUsage`] readings and the [`NodeProbe`]
//!   seam. An unreachable node yields a maximal-pressure reading, never a
//!   missing one.
//!
//! - **`monitor`**: The [`AdmissionMonitor`] timer loop, the [`HealthPolicy`]
//!   that turns readings into a verdict, and the [`MonitorHandle`] readers
//!   use to see the last published verdict without waiting.

/// Node memory readings.
pub mod memory;
/// Timer-driven monitor and health verdicts.
pub mod monitor;

// --- Public API Re-exports ---
pub use memory::{iter_cluster_memory_usage, MemoryUsage, NodeProbe};
pub use monitor::{AdmissionMonitor, HealthPolicy, MonitorHandle, ServiceDefinition, ServiceSnapshot};
