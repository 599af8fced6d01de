//! Subject Optimizer Library
//!
//! Subject-line A/B testing driven by a multi-armed bandit.
//!
//! # Key Features
//! - Round-robin exploration, then Thompson sampling on Beta posteriors
//! - Wilson score confidence intervals on every reported rate
//! - Transactional counter updates (RocksDB `TransactionDB` or in-memory)
//! - Idempotent test creation keyed by a content fingerprint
//! - AI-generated subject lines behind a TTL cache

pub mod bandit;
pub mod config;
pub mod constants;
pub mod errors;
pub mod generation;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod stats;
pub mod storage;
pub mod tracing_setup;
pub mod validation;

// Re-export dependencies to ensure tests/benchmarks use the same version
pub use chrono;
pub use uuid;
