//! File format detection.
//!
//! Decides whether a file holds one JSON document or a sequence of records.
//! Detection never fails: missing, non-regular and empty files come back as
//! [`StreamFormat::Unknown`] with a distinct [`SniffReason`].

use std::fmt;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use super::extractor::{ExtractorOptions, Layout, RecordScanner};

/// Bytes read from the head of a file for content-based detection.
const SNIFF_HEAD_BYTES: usize = 1024 * 1024;

/// Read size used while checking that nothing follows a single-line array.
const TAIL_CHUNK_BYTES: usize = 64 * 1024;

/// Physical layout of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// One JSON document (an object or an array of objects).
    Json,
    /// A sequence of objects, one per line or spanning lines.
    Jsonl,
    Unknown,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Json => "json",
            StreamFormat::Jsonl => "jsonl",
            StreamFormat::Unknown => "unknown",
        }
    }

    /// Extractor layout used to read a file of this format.
    pub fn layout(&self) -> Layout {
        match self {
            StreamFormat::Json => Layout::Document,
            _ => Layout::Records,
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a format was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SniffReason {
    Extension,
    /// First line parsed as an array and nothing else follows.
    SingleLineArray,
    /// First line parsed as an object and further lines follow.
    LineRecords,
    /// The file is a single one-line object.
    SingleRecord,
    /// A complete object was found inside a multi-line top-level array.
    MultilineArray,
    /// A complete multi-line object was found by brace counting.
    BraceSample,
    NotFound,
    NotAFile,
    Empty,
    Unreadable(String),
    NoCompleteObject,
}

impl fmt::Display for SniffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffReason::Extension => write!(f, "file extension"),
            SniffReason::SingleLineArray => write!(f, "whole file is one JSON array"),
            SniffReason::LineRecords => write!(f, "first line is a complete object and more lines follow"),
            SniffReason::SingleRecord => write!(f, "file is a single one-line object"),
            SniffReason::MultilineArray => write!(f, "multi-line top-level array of objects"),
            SniffReason::BraceSample => write!(f, "complete object found in sampled lines"),
            SniffReason::NotFound => write!(f, "file not found"),
            SniffReason::NotAFile => write!(f, "not a regular file"),
            SniffReason::Empty => write!(f, "file is empty"),
            SniffReason::Unreadable(e) => write!(f, "file could not be read: {}", e),
            SniffReason::NoCompleteObject => write!(f, "no complete JSON object in sampled lines"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SniffResult {
    pub format: StreamFormat,
    pub reason: SniffReason,
}

impl SniffResult {
    fn new(format: StreamFormat, reason: SniffReason) -> Self {
        Self { format, reason }
    }

    fn unknown(reason: SniffReason) -> Self {
        Self::new(StreamFormat::Unknown, reason)
    }

    pub fn is_known(&self) -> bool {
        self.format != StreamFormat::Unknown
    }
}

/// Detects the format of the file at `path`, sampling up to `sample_lines`
/// lines when the first line alone is not conclusive.
pub async fn sniff_path(path: &Path, sample_lines: usize) -> SniffResult {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return SniffResult::unknown(SniffReason::NotFound)
        }
        Err(e) => return SniffResult::unknown(SniffReason::Unreadable(e.to_string())),
    };
    if !meta.is_file() {
        return SniffResult::unknown(SniffReason::NotAFile);
    }
    if meta.len() == 0 {
        return SniffResult::unknown(SniffReason::Empty);
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("json") => return SniffResult::new(StreamFormat::Json, SniffReason::Extension),
        Some("jsonl") => return SniffResult::new(StreamFormat::Jsonl, SniffReason::Extension),
        _ => {}
    }

    match sniff_content(path, meta.len(), sample_lines).await {
        Ok(result) => result,
        Err(e) => SniffResult::unknown(SniffReason::Unreadable(e.to_string())),
    }
}

async fn sniff_content(
    path: &Path,
    file_len: u64,
    sample_lines: usize,
) -> std::io::Result<SniffResult> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_HEAD_BYTES.min(file_len as usize));
    (&mut file)
        .take(SNIFF_HEAD_BYTES as u64)
        .read_to_end(&mut head)
        .await?;
    let whole_file_in_head = head.len() as u64 >= file_len;
    let text = String::from_utf8_lossy(&head);

    if text.trim().is_empty() && whole_file_in_head {
        return Ok(SniffResult::unknown(SniffReason::Empty));
    }

    let start = text.len() - text.trim_start().len();
    let body = &text[start..];
    let (first_line, rest, line_complete) = match body.find('\n') {
        Some(pos) => (&body[..pos], &body[pos + 1..], true),
        None => (body, "", whole_file_in_head),
    };

    if line_complete {
        match serde_json::from_str::<Value>(first_line.trim()) {
            Ok(Value::Array(_)) => {
                let nothing_follows =
                    rest.trim().is_empty() && (whole_file_in_head || tail_is_blank(&mut file).await?);
                let result = if nothing_follows {
                    SniffResult::new(StreamFormat::Json, SniffReason::SingleLineArray)
                } else {
                    SniffResult::new(StreamFormat::Jsonl, SniffReason::LineRecords)
                };
                return Ok(result);
            }
            Ok(Value::Object(_)) => {
                let more_lines = !rest.trim().is_empty() || !whole_file_in_head;
                let reason = if more_lines {
                    SniffReason::LineRecords
                } else {
                    SniffReason::SingleRecord
                };
                return Ok(SniffResult::new(StreamFormat::Jsonl, reason));
            }
            _ => {}
        }
    }

    Ok(sniff_sample(body, sample_lines))
}

/// Brace-counts the first `sample_lines` lines looking for one complete object.
fn sniff_sample(body: &str, sample_lines: usize) -> SniffResult {
    let mut scanner = RecordScanner::new(ExtractorOptions::new(Layout::Document));
    let mut found = false;

    for line in body.split_inclusive('\n').take(sample_lines) {
        if scanner.push(line).iter().any(|r| r.is_ok()) {
            found = true;
            break;
        }
    }

    if !found {
        return SniffResult::unknown(SniffReason::NoCompleteObject);
    }
    if body.starts_with('[') {
        SniffResult::new(StreamFormat::Json, SniffReason::MultilineArray)
    } else {
        SniffResult::new(StreamFormat::Jsonl, SniffReason::BraceSample)
    }
}

/// Reads the remainder of `file`, stopping at the first non-whitespace byte.
async fn tail_is_blank(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    let mut chunk = vec![0u8; TAIL_CHUNK_BYTES];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(true);
        }
        if chunk[..n].iter().any(|b| !b.is_ascii_whitespace()) {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sniff_text(name: &str, text: &str) -> SniffResult {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(name);
        tokio::fs::write(&path, text).await.expect("write");
        sniff_path(&path, 10).await
    }

    #[tokio::test]
    async fn test_extension_is_trusted() {
        let r = sniff_text("data.JSON", "{\"a\":1}\n{\"a\":2}\n").await;
        assert_eq!(r.format, StreamFormat::Json);
        assert_eq!(r.reason, SniffReason::Extension);

        let r = sniff_text("data.jsonl", "[1, 2]").await;
        assert_eq!(r.format, StreamFormat::Jsonl);
    }

    #[tokio::test]
    async fn test_single_line_array_is_json() {
        let r = sniff_text("dump.txt", "\n[{\"a\":1},{\"a\":2}]\n\n").await;
        assert_eq!(r.format, StreamFormat::Json);
        assert_eq!(r.reason, SniffReason::SingleLineArray);
    }

    #[tokio::test]
    async fn test_line_records_are_jsonl() {
        let r = sniff_text("dump.log", "{\"a\":1}\n{\"a\":2}\n").await;
        assert_eq!(r.format, StreamFormat::Jsonl);
        assert_eq!(r.reason, SniffReason::LineRecords);
    }

    #[tokio::test]
    async fn test_pretty_printed_objects_found_by_sample() {
        let r = sniff_text("dump.out", "{\n  \"a\": \"{\",\n  \"b\": 2\n}\n{\n  \"a\": 3\n}\n").await;
        assert_eq!(r.format, StreamFormat::Jsonl);
        assert_eq!(r.reason, SniffReason::BraceSample);
    }

    #[tokio::test]
    async fn test_pretty_printed_array_is_json() {
        let r = sniff_text("dump.out", "[\n  {\n    \"a\": 1\n  }\n]\n").await;
        assert_eq!(r.format, StreamFormat::Json);
        assert_eq!(r.reason, SniffReason::MultilineArray);
    }

    #[tokio::test]
    async fn test_object_beyond_sample_is_unknown() {
        let mut text = String::from("{\n");
        for i in 0..20 {
            text.push_str(&format!("  \"k{}\": {},\n", i, i));
        }
        text.push_str("  \"end\": true\n}\n");
        let r = sniff_text("big.out", &text).await;
        assert_eq!(r.format, StreamFormat::Unknown);
        assert_eq!(r.reason, SniffReason::NoCompleteObject);
    }

    #[tokio::test]
    async fn test_distinct_unknown_reasons() {
        let dir = tempfile::tempdir().expect("temp dir");

        let r = sniff_path(&dir.path().join("missing.jsonl"), 10).await;
        assert_eq!(r.reason, SniffReason::NotFound);

        let r = sniff_path(dir.path(), 10).await;
        assert_eq!(r.reason, SniffReason::NotAFile);

        let empty = dir.path().join("empty.jsonl");
        tokio::fs::write(&empty, "").await.expect("write");
        let r = sniff_path(&empty, 10).await;
        assert_eq!(r.reason, SniffReason::Empty);
        assert!(!r.is_known());

        let r = sniff_text("blank.txt", "   \n\n").await;
        assert_eq!(r.reason, SniffReason::Empty);
    }

    #[test]
    fn test_format_layout() {
        assert_eq!(StreamFormat::Json.layout(), Layout::Document);
        assert_eq!(StreamFormat::Jsonl.layout(), Layout::Records);
        assert_eq!(StreamFormat::Jsonl.to_string(), "jsonl");
    }
}
