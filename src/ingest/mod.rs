//! Trajectory ingestion.
//!
//! The ingestion path runs leaf-first:
//! 1. [`sniffer`] decides whether a file is one JSON document or a record stream
//! 2. [`extractor`] yields complete top-level objects without loading the file
//! 3. [`normalizer`] maps each record shape onto [`Trajectory`](crate::trajectory::Trajectory)
//! 4. [`writer`] drops known ids and writes survivors in batches
//!
//! [`importer::Importer`] wires these together; [`context::ImportContext`]
//! keeps task status and history for the caller.

pub mod context;
pub mod extractor;
pub mod importer;
pub mod normalizer;
pub mod progress;
pub mod sniffer;
pub mod writer;

use std::path::PathBuf;
use std::time::Duration;

pub use context::{ImportContext, ImportHistoryEntry, ImportResult, ImportStatus};
pub use extractor::{extract_records, ExtractedRecord, ExtractorOptions, Layout, RecordScanner};
pub use importer::Importer;
pub use normalizer::{Candidate, RecordNormalizer};
pub use sniffer::{sniff_path, SniffReason, SniffResult, StreamFormat};
pub use writer::{BatchWriter, Offer, WriteCounts};

/// Tuning for one importer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub progress_every: usize,
    pub progress_log_interval: Duration,
    pub max_record_bytes: usize,
    pub sniff_sample_lines: usize,
    /// Empty means any readable file may be imported.
    pub allowed_directories: Vec<PathBuf>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            progress_every: 100,
            progress_log_interval: Duration::from_secs(5),
            max_record_bytes: 64 * 1024 * 1024,
            sniff_sample_lines: 10,
            allowed_directories: Vec::new(),
        }
    }
}

impl ImportOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
