//! # Connections Module
//!
//! Implementations of the collaborator seams that hold real connections
//! (Redis) or stand in for them in-process.

/// Process-local cache with expiry, for tests and single-node runs.
pub mod cache_memory;

/// Redis-backed cache, task queue, broker partitions and node probes.
#[cfg(feature = "connections")]
pub mod cache_redis;
