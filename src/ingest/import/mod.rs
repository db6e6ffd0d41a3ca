//! Streaming import pipeline.
//!
//! 1. **Batching** (`batch`) - fixed-size batches loaded on bounded tokio tasks
//! 2. **Coordination** (`coordinator`) - drives parsing, typing, classification and loading
//! 3. **Statistics** (`stats`) - counters, progress snapshots and the job result

pub mod batch;
pub mod coordinator;
pub mod stats;

pub use coordinator::ImportEngine;
pub use stats::{ImportProgress, ImportResult, ImportStats};
