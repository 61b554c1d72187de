//! Error types for traj-lens operations.
//!
//! Defines the error taxonomy of the ingestion path:
//! - Record extraction from a character stream
//! - Whole-call ingestion failures (unopenable or unclassifiable input)
//! - Classification of stored trajectories
//!
//! Per-record problems (invalid JSON, failed validation, failed batch flush)
//! are never raised: they are collected as strings on the import result.
//! Storage and configuration errors live next to their modules.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StoreError;

/// Errors produced by the streaming record extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Text that could not be decoded as a JSON object.
    #[error("Invalid JSON near line {line}: {message}. Text starts with: '{preview}'")]
    Parse {
        line: usize,
        message: String,
        preview: String,
    },

    /// A top-level array appeared where object records were expected.
    #[error("Top-level JSON array at line {line} is not supported; records must be objects")]
    TopLevelArray { line: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// True when the stream cannot continue after this error.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExtractError::Parse { .. })
    }

    /// Line the error refers to, when known.
    pub fn line(&self) -> Option<usize> {
        match self {
            ExtractError::Parse { line, .. } | ExtractError::TopLevelArray { line } => Some(*line),
            ExtractError::Io(_) => None,
        }
    }
}

/// Errors that fail an entire ingestion call.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("File does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Not a file: {0}")]
    NotAFile(PathBuf),

    #[error("Path not in allowed directories: {path}. Allowed: {allowed}")]
    PathNotAllowed { path: PathBuf, allowed: String },

    /// The file could not be classified as JSON or JSONL.
    #[error("Unrecognised stream format for {path}: {reason}")]
    UnknownFormat { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The existing-id snapshot could not be loaded.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Errors from classifying stored trajectories.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Trajectory not found: {0}")]
    NotFound(String),

    /// The configured structural tag pattern is not a valid regex.
    #[error("Invalid marker pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Builds a bounded, char-boundary-safe preview of `text` for error messages.
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
