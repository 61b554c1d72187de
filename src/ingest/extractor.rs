//! Streaming extraction of top-level JSON objects from a character stream.
//!
//! The extractor never holds more than the record currently being assembled.
//! It handles both physical layouts produced by agent frameworks:
//! 1. One object per line (JSONL)
//! 2. Objects spanning many lines, concatenated or wrapped in a top-level array
//!
//! # Strategy
//!
//! Input is appended to a buffer. A line-terminated chunk arriving while
//! nothing is pending is first parsed whole (the common single-line case).
//! Otherwise the buffer is scanned character by character, tracking string
//! literals, escapes and brace depth, so braces inside strings never affect
//! depth. When depth returns to zero the matched text is parsed; on success
//! the record is yielded and only the remainder is retained, on failure the
//! text keeps accumulating until the next line starting a fresh object.
//!
//! In [`Layout::Records`] a `{` in the first column of a later line also
//! ends a candidate whose braces never balanced (a line truncated by a crash
//! mid-write): the pending text is reported and scanning restarts there.
//! Nested objects of pretty-printed records are indented, so they never
//! trigger this.
//! At end of stream any residual text is parsed once more and reported as an
//! error if it still fails.
//!
//! # Example
//!
//! ```
//! use traj_lens::ingest::extractor::{extract_all, Layout};
//!
//! let text = "{\"a\": 1}\n{\n  \"b\": \"}\"\n}\n";
//! let records: Vec<_> = extract_all(text, Layout::Records)
//!     .into_iter()
//!     .map(|r| r.expect("valid record"))
//!     .collect();
//! assert_eq!(records.len(), 2);
//! assert_eq!(records[1].value["b"], "}");
//! ```

use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{preview, ExtractError};

/// Size of each read from the underlying stream.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Characters of offending text kept in error previews.
const PREVIEW_CHARS: usize = 100;

/// Physical layout the extractor expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Concatenated objects, one per line or spanning lines. Top-level arrays are rejected.
    Records,
    /// One document: either a single object or an array of objects.
    /// Concatenated objects are tolerated.
    Document,
}

/// Extractor tuning.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorOptions {
    pub layout: Layout,
    /// Maximum size of a single pending record before it is reported and skipped.
    pub max_record_bytes: usize,
}

impl ExtractorOptions {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            max_record_bytes: 64 * 1024 * 1024,
        }
    }

    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }
}

/// A decoded top-level object together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRecord {
    pub value: Value,
    /// 0-based position among the records yielded so far.
    pub index: usize,
    /// 1-based line on which the record starts.
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Envelope {
    None,
    Open,
    Closed,
}

/// A balanced candidate that failed to parse and is still accumulating.
#[derive(Debug)]
struct FailedCandidate {
    end: usize,
    message: String,
    newline_seen: bool,
}

#[derive(Debug)]
struct Junk {
    line: usize,
    text: String,
}

/// Incremental scanner: feed it text with [`push`](Self::push), then call
/// [`finish`](Self::finish) once the stream ends.
#[derive(Debug)]
pub struct RecordScanner {
    options: ExtractorOptions,
    buffer: String,
    scan_pos: usize,

    brace_depth: usize,
    in_string: bool,
    escape_next: bool,
    object_start: Option<usize>,
    object_line: usize,
    failed: Option<FailedCandidate>,

    line: usize,
    after_newline: bool,
    emitted: usize,
    seen_content: bool,
    envelope: Envelope,
    junk: Option<Junk>,
    resyncing: bool,
    at_line_start: bool,
    halted: bool,
}

impl RecordScanner {
    pub fn new(options: ExtractorOptions) -> Self {
        Self {
            options,
            buffer: String::new(),
            scan_pos: 0,
            brace_depth: 0,
            in_string: false,
            escape_next: false,
            object_start: None,
            object_line: 1,
            failed: None,
            line: 1,
            after_newline: true,
            emitted: 0,
            seen_content: false,
            envelope: Envelope::None,
            junk: None,
            resyncing: false,
            at_line_start: true,
            halted: false,
        }
    }

    /// Bytes currently retained for an incomplete record.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// True once a terminal error was produced or [`finish`](Self::finish) ran.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Feeds a chunk of text and returns every record (or per-record error)
    /// completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<Result<ExtractedRecord, ExtractError>> {
        let mut out = Vec::new();
        if self.halted || chunk.is_empty() {
            return out;
        }

        if chunk.ends_with('\n') && self.is_idle() && self.try_whole(chunk, &mut out) {
            self.line += chunk.matches('\n').count();
            self.after_newline = true;
            return out;
        }

        self.buffer.push_str(chunk);
        self.scan(&mut out);
        if !self.halted {
            self.compact();
            self.enforce_limit(&mut out);
        }
        out
    }

    /// Signals end of stream: residual text is parsed once more and reported
    /// if it still fails.
    pub fn finish(&mut self) -> Vec<Result<ExtractedRecord, ExtractError>> {
        let mut out = Vec::new();
        if self.halted {
            return out;
        }
        self.halted = true;

        self.flush_junk(&mut out);

        if let Some(start) = self.object_start.take() {
            let residual = self.buffer[start..].trim();
            if !residual.is_empty() {
                match serde_json::from_str::<Value>(residual) {
                    Ok(value) if value.is_object() => {
                        let line = self.object_line;
                        self.emit(value, line, &mut out);
                    }
                    Ok(_) => out.push(Err(ExtractError::Parse {
                        line: self.object_line,
                        message: "residual text is not a JSON object".to_string(),
                        preview: preview(residual, PREVIEW_CHARS),
                    })),
                    Err(e) => {
                        let message = match self.failed.take() {
                            Some(failed) => failed.message,
                            None => format!("incomplete record at end of stream ({})", e),
                        };
                        out.push(Err(ExtractError::Parse {
                            line: self.object_line,
                            message,
                            preview: preview(residual, PREVIEW_CHARS),
                        }));
                    }
                }
            }
        }

        if self.envelope == Envelope::Open {
            out.push(Err(ExtractError::Parse {
                line: self.line,
                message: "unterminated top-level array".to_string(),
                preview: String::new(),
            }));
        }

        self.buffer.clear();
        self.scan_pos = 0;
        out
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty()
            && self.object_start.is_none()
            && self.junk.is_none()
            && !self.resyncing
    }

    /// Fast path for a complete line: returns false if the line must be scanned.
    fn try_whole(
        &mut self,
        chunk: &str,
        out: &mut Vec<Result<ExtractedRecord, ExtractError>>,
    ) -> bool {
        let trimmed = chunk.trim();
        if trimmed.is_empty() {
            return true;
        }

        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return false;
        };

        let leading = &chunk[..chunk.len() - chunk.trim_start().len()];
        let line = self.line + leading.matches('\n').count();

        match value {
            Value::Object(_) => self.emit(value, line, out),
            Value::Array(items) => {
                let accepts_array = self.options.layout == Layout::Document
                    && self.envelope == Envelope::None
                    && !self.seen_content;
                if !accepts_array {
                    out.push(Err(ExtractError::TopLevelArray { line }));
                    self.halted = true;
                    return true;
                }
                for item in items {
                    if item.is_object() {
                        self.emit(item, line, out);
                    } else {
                        out.push(Err(ExtractError::Parse {
                            line,
                            message: "array element is not a JSON object".to_string(),
                            preview: preview(&item.to_string(), PREVIEW_CHARS),
                        }));
                    }
                }
                self.envelope = Envelope::Closed;
            }
            _ => out.push(Err(ExtractError::Parse {
                line,
                message: "expected a JSON object".to_string(),
                preview: preview(trimmed, PREVIEW_CHARS),
            })),
        }

        self.seen_content = true;
        true
    }

    fn scan(&mut self, out: &mut Vec<Result<ExtractedRecord, ExtractError>>) {
        let mut pos = self.scan_pos;

        while let Some(c) = self.buffer[pos..].chars().next() {
            let i = pos;
            pos += c.len_utf8();
            let line_start = self.after_newline;
            self.after_newline = c == '\n';

            if c == '\n' {
                self.line += 1;
            }

            if self.resyncing {
                if c == '\n' {
                    self.at_line_start = true;
                    continue;
                }
                if self.at_line_start && c == '{' {
                    self.resyncing = false;
                } else {
                    if !c.is_whitespace() {
                        self.at_line_start = false;
                    }
                    continue;
                }
            }

            if c == '\n' && self.in_string {
                // A raw line break cannot occur inside a JSON string.
                self.in_string = false;
                self.escape_next = false;
            }

            if self.escape_next {
                self.escape_next = false;
                continue;
            }

            if self.in_string {
                match c {
                    '\\' => self.escape_next = true,
                    '"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }

            if self.brace_depth > 0 {
                if c == '{' && line_start && self.options.layout == Layout::Records {
                    self.abandon_unbalanced(i, out);
                    self.open_object(i, out);
                    continue;
                }
                match c {
                    '"' => self.in_string = true,
                    '{' => self.brace_depth += 1,
                    '}' => {
                        self.brace_depth -= 1;
                        if self.brace_depth == 0 {
                            self.close_candidate(i, out);
                        }
                    }
                    _ => {}
                }
                continue;
            }

            // Top level, between records.
            if self.failed.is_some() {
                match c {
                    '{' => self.open_object(i, out),
                    '\n' => {
                        if let Some(failed) = self.failed.as_mut() {
                            failed.newline_seen = true;
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match c {
                '{' => self.open_object(i, out),
                c if c.is_whitespace() => {}
                '[' if self.options.layout == Layout::Document
                    && self.envelope == Envelope::None
                    && !self.seen_content =>
                {
                    self.envelope = Envelope::Open;
                    self.seen_content = true;
                }
                '[' if self.options.layout == Layout::Records
                    && !self.seen_content
                    && self.junk.is_none() =>
                {
                    out.push(Err(ExtractError::TopLevelArray { line: self.line }));
                    self.halted = true;
                    self.buffer.clear();
                    self.scan_pos = 0;
                    return;
                }
                ',' if self.envelope == Envelope::Open => {}
                ']' if self.envelope == Envelope::Open => self.envelope = Envelope::Closed,
                other => self.record_junk(other),
            }
        }

        self.scan_pos = pos;
    }

    fn open_object(&mut self, i: usize, out: &mut Vec<Result<ExtractedRecord, ExtractError>>) {
        if let Some(failed) = self.failed.take() {
            if !failed.newline_seen {
                // Same line as the failed candidate: keep accumulating.
                self.failed = Some(failed);
                self.brace_depth = 1;
                return;
            }
            if let Some(start) = self.object_start.take() {
                out.push(Err(ExtractError::Parse {
                    line: self.object_line,
                    message: failed.message,
                    preview: preview(&self.buffer[start..=failed.end], PREVIEW_CHARS),
                }));
            }
        }

        self.flush_junk(out);
        self.object_start = Some(i);
        self.object_line = self.line;
        self.brace_depth = 1;
        self.seen_content = true;
    }

    fn close_candidate(&mut self, i: usize, out: &mut Vec<Result<ExtractedRecord, ExtractError>>) {
        let Some(start) = self.object_start else {
            return;
        };

        match serde_json::from_str::<Value>(&self.buffer[start..=i]) {
            Ok(value) => {
                self.object_start = None;
                self.failed = None;
                let line = self.object_line;
                self.emit(value, line, out);
            }
            Err(e) => {
                tracing::trace!(line = self.object_line, error = %e, "Balanced candidate failed to parse");
                self.failed = Some(FailedCandidate {
                    end: i,
                    message: e.to_string(),
                    newline_seen: false,
                });
            }
        }
    }

    /// Reports the pending candidate as incomplete and drops it.
    fn abandon_unbalanced(
        &mut self,
        i: usize,
        out: &mut Vec<Result<ExtractedRecord, ExtractError>>,
    ) {
        let failed = self.failed.take();
        if let Some(start) = self.object_start.take() {
            let message = match failed {
                Some(failed) => failed.message,
                None => "incomplete record: a new record starts before its braces balance"
                    .to_string(),
            };
            tracing::debug!(line = self.object_line, "Dropping unbalanced record");
            out.push(Err(ExtractError::Parse {
                line: self.object_line,
                message,
                preview: preview(&self.buffer[start..i], PREVIEW_CHARS),
            }));
        }
        self.brace_depth = 0;
    }

    fn emit(
        &mut self,
        value: Value,
        line: usize,
        out: &mut Vec<Result<ExtractedRecord, ExtractError>>,
    ) {
        out.push(Ok(ExtractedRecord {
            value,
            index: self.emitted,
            line,
        }));
        self.emitted += 1;
    }

    fn record_junk(&mut self, c: char) {
        let line = self.line;
        let junk = self.junk.get_or_insert_with(|| Junk {
            line,
            text: String::new(),
        });
        if junk.text.len() < PREVIEW_CHARS * 4 {
            junk.text.push(c);
        }
        self.seen_content = true;
    }

    fn flush_junk(&mut self, out: &mut Vec<Result<ExtractedRecord, ExtractError>>) {
        if let Some(junk) = self.junk.take() {
            out.push(Err(ExtractError::Parse {
                line: junk.line,
                message: "unexpected content outside of a JSON object".to_string(),
                preview: preview(&junk.text, PREVIEW_CHARS),
            }));
        }
    }

    /// Drops everything before the pending record.
    fn compact(&mut self) {
        let keep_from = self.object_start.unwrap_or(self.buffer.len());
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.scan_pos -= keep_from;
        if let Some(start) = self.object_start.as_mut() {
            *start -= keep_from;
        }
        if let Some(failed) = self.failed.as_mut() {
            failed.end -= keep_from;
        }
    }

    fn enforce_limit(&mut self, out: &mut Vec<Result<ExtractedRecord, ExtractError>>) {
        if self.buffer.len() <= self.options.max_record_bytes {
            return;
        }

        out.push(Err(ExtractError::Parse {
            line: self.object_line,
            message: format!(
                "record exceeds {} bytes without completing; skipped to the next line starting an object",
                self.options.max_record_bytes
            ),
            preview: preview(&self.buffer, PREVIEW_CHARS),
        }));

        self.buffer.clear();
        self.scan_pos = 0;
        self.brace_depth = 0;
        self.in_string = false;
        self.escape_next = false;
        self.object_start = None;
        self.failed = None;
        self.resyncing = true;
        self.at_line_start = false;
    }
}

/// Extracts every record from an in-memory string.
pub fn extract_all(text: &str, layout: Layout) -> Vec<Result<ExtractedRecord, ExtractError>> {
    let mut scanner = RecordScanner::new(ExtractorOptions::new(layout));
    let mut results = Vec::new();
    for line in text.split_inclusive('\n') {
        results.extend(scanner.push(line));
    }
    results.extend(scanner.finish());
    results
}

/// Turns a byte stream into a lazy, non-restartable stream of records.
///
/// Per-record failures are yielded as `Err` items and the stream continues;
/// terminal failures (I/O, top-level array in [`Layout::Records`]) end it.
pub fn extract_records<R>(
    mut reader: R,
    options: ExtractorOptions,
) -> impl Stream<Item = Result<ExtractedRecord, ExtractError>> + Send
where
    R: AsyncRead + Unpin + Send,
{
    async_stream::stream! {
        let mut scanner = RecordScanner::new(options);
        let mut raw = vec![0u8; READ_CHUNK_BYTES];
        let mut undecoded: Vec<u8> = Vec::new();

        loop {
            let n = match reader.read(&mut raw).await {
                Ok(n) => n,
                Err(e) => {
                    yield Err(ExtractError::Io(e));
                    return;
                }
            };
            if n == 0 {
                break;
            }

            undecoded.extend_from_slice(&raw[..n]);
            let text = decode_utf8_prefix(&mut undecoded);
            for piece in text.split_inclusive('\n') {
                for item in scanner.push(piece) {
                    yield item;
                }
                if scanner.is_halted() {
                    return;
                }
            }
        }

        if !undecoded.is_empty() {
            let tail = String::from_utf8_lossy(&undecoded).into_owned();
            for item in scanner.push(&tail) {
                yield item;
            }
        }
        for item in scanner.finish() {
            yield item;
        }
    }
}

/// Decodes the longest valid UTF-8 prefix, leaving an incomplete trailing
/// sequence in `bytes` for the next read. Invalid sequences are replaced.
fn decode_utf8_prefix(bytes: &mut Vec<u8>) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => {
            let text = s.to_owned();
            bytes.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&bytes[..valid]).into_owned();
            bytes.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            bytes.clear();
            text
        }
    }
}
