//! traj-lens: agent trajectory ingestion, failure analysis and training statistics.
//!
//! This library provides tools for importing recorded agent trajectories from
//! JSON/JSONL files of any size, classifying why runs failed, and computing
//! pass rates and reward statistics over the stored corpus.

// Core modules
pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod stats;
pub mod storage;
pub mod trajectory;

// Re-export commonly used error types
pub use error::{AnalysisError, ExtractError, IngestError};
pub use storage::StoreError;
