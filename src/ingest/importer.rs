//! End-to-end ingestion: path policy, format detection, streaming
//! extraction, normalization and batched writes.
//!
//! Only problems that prevent reading the input at all are returned as
//! [`IngestError`]. Everything that goes wrong with individual records ends
//! up in the returned [`ImportResult`].

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use super::context::{ImportContext, ImportResult, ImportStatus};
use super::extractor::{extract_records, ExtractedRecord, ExtractorOptions};
use super::normalizer::{Candidate, RecordNormalizer};
use super::progress::{ProgressCounters, ProgressMonitor};
use super::sniffer::{sniff_path, SniffReason, StreamFormat};
use super::writer::{BatchWriter, Offer};
use super::ImportOptions;
use crate::error::{ExtractError, IngestError};
use crate::metrics::IngestMetrics;
use crate::storage::TrajectoryStore;

/// Progress reported while streaming; 100 is reserved for completion.
const MAX_STREAMING_PROGRESS: usize = 90;

pub struct Importer {
    store: Arc<dyn TrajectoryStore>,
    options: ImportOptions,
    context: Arc<ImportContext>,
    metrics: Option<Arc<IngestMetrics>>,
}

impl Importer {
    pub fn new(store: Arc<dyn TrajectoryStore>, options: ImportOptions) -> Self {
        Self {
            store,
            options,
            context: Arc::new(ImportContext::default()),
            metrics: None,
        }
    }

    /// Shares an existing context (task map and history) with this importer.
    pub fn with_context(mut self, context: Arc<ImportContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn context(&self) -> &Arc<ImportContext> {
        &self.context
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Resolves `path` and checks it against the allowed directories.
    pub async fn check_path(&self, path: &Path) -> Result<PathBuf, IngestError> {
        let resolved = match tokio::fs::canonicalize(path).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IngestError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(IngestError::Io(e)),
        };

        let meta = tokio::fs::metadata(&resolved).await?;
        if !meta.is_file() {
            return Err(IngestError::NotAFile(path.to_path_buf()));
        }

        if self.options.allowed_directories.is_empty() {
            return Ok(resolved);
        }

        let mut allowed = Vec::with_capacity(self.options.allowed_directories.len());
        for dir in &self.options.allowed_directories {
            if let Ok(dir) = tokio::fs::canonicalize(dir).await {
                if resolved.starts_with(&dir) {
                    return Ok(resolved);
                }
                allowed.push(dir.display().to_string());
            }
        }

        Err(IngestError::PathNotAllowed {
            path: resolved,
            allowed: allowed.join(", "),
        })
    }

    /// Imports every record of the file at `path`.
    pub async fn import_file(&self, path: &Path) -> Result<ImportResult, IngestError> {
        let mut result = ImportResult::processing(Uuid::new_v4().to_string());
        result.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.context.begin(&result).await;

        match self.run_file(path, &mut result).await {
            Ok(()) => {
                self.context.complete(&result).await;
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(task_id = %result.task_id, path = %path.display(), error = %e, "Import failed");
                result.fail(e.to_string());
                self.context.complete(&result).await;
                Err(e)
            }
        }
    }

    async fn run_file(&self, path: &Path, result: &mut ImportResult) -> Result<(), IngestError> {
        let resolved = self.check_path(path).await?;

        let sniff = sniff_path(&resolved, self.options.sniff_sample_lines).await;
        let format = match sniff.format {
            StreamFormat::Unknown => {
                return Err(match sniff.reason {
                    SniffReason::NotFound => IngestError::NotFound(resolved),
                    SniffReason::NotAFile => IngestError::NotAFile(resolved),
                    reason => IngestError::UnknownFormat {
                        path: resolved,
                        reason: reason.to_string(),
                    },
                })
            }
            known => known,
        };
        result.format = Some(format);

        let file = tokio::fs::File::open(&resolved).await?;
        let source = match format {
            StreamFormat::Json => "json_import",
            _ => "jsonl_import",
        };

        tracing::info!(
            task_id = %result.task_id,
            path = %resolved.display(),
            format = %format,
            reason = %sniff.reason,
            "Starting import"
        );

        let counters = ProgressCounters::new();
        let mut writer = self.writer(counters.clone()).await?;
        let monitor = ProgressMonitor::start(
            counters.clone(),
            result.task_id.clone(),
            self.options.progress_log_interval,
        );

        let normalizer = RecordNormalizer::new(source);
        let extractor = ExtractorOptions::new(format.layout())
            .with_max_record_bytes(self.options.max_record_bytes);
        let stream = extract_records(file, extractor);
        tokio::pin!(stream);

        let mut terminal: Option<ExtractError> = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    counters.extracted.fetch_add(1, Ordering::Relaxed);
                    let candidates = normalizer.normalize(&record.value);
                    self.write_candidates(&mut writer, &record, candidates, &result.task_id)
                        .await;
                }
                Err(e) if !e.is_terminal() => {
                    let line = e.line().unwrap_or(0);
                    tracing::debug!(line, error = %e, "Unparseable record");
                    writer.record_failure(format!("Line {}: {}", line, e));
                }
                Err(e) => {
                    terminal = Some(e);
                    break;
                }
            }
        }

        let (counts, errors) = writer.finish().await;
        monitor.stop().await;

        result.apply_counts(counts);
        result.errors.extend(errors);

        let status = match terminal {
            Some(e) => {
                tracing::warn!(task_id = %result.task_id, error = %e, "Import stopped early");
                result.errors.push(e.to_string());
                ImportStatus::Failed
            }
            None => ImportStatus::Completed,
        };
        result.finish(status);
        result.message = format!(
            "Imported {} trajectories from {} ({} skipped, {} failed)",
            counts.imported, format, counts.skipped, counts.failed
        );

        tracing::info!(
            task_id = %result.task_id,
            imported = counts.imported,
            skipped = counts.skipped,
            failed = counts.failed,
            "Import finished"
        );
        Ok(())
    }

    /// Imports one already-decoded record (or batch wrapper).
    pub async fn import_value(&self, value: &Value) -> Result<ImportResult, IngestError> {
        let mut result = ImportResult::processing(Uuid::new_v4().to_string());
        self.context.begin(&result).await;

        let mut writer = match self.writer(ProgressCounters::new()).await {
            Ok(w) => w,
            Err(e) => {
                result.fail(e.to_string());
                self.context.complete(&result).await;
                return Err(e);
            }
        };

        let record = ExtractedRecord {
            value: value.clone(),
            index: 0,
            line: 1,
        };
        let candidates = RecordNormalizer::new("dict_import").normalize(value);
        self.write_candidates(&mut writer, &record, candidates, &result.task_id)
            .await;

        let (counts, errors) = writer.finish().await;
        result.apply_counts(counts);
        result.errors.extend(errors);
        if counts.skipped > 0 {
            result
                .warnings
                .push(format!("{} trajectories already exist", counts.skipped));
        }
        result.finish(ImportStatus::Completed);
        result.message = format!("Imported {} trajectories", counts.imported);

        self.context.complete(&result).await;
        Ok(result)
    }

    async fn writer(&self, counters: ProgressCounters) -> Result<BatchWriter<'_>, IngestError> {
        let writer = BatchWriter::new(
            self.store.as_ref(),
            self.options.batch_size,
            self.options.progress_every,
        )
        .await?
        .with_counters(counters);

        Ok(match self.metrics.as_deref() {
            Some(m) => writer.with_metrics(m),
            None => writer,
        })
    }

    async fn write_candidates(
        &self,
        writer: &mut BatchWriter<'_>,
        record: &ExtractedRecord,
        candidates: Vec<Candidate>,
        task_id: &str,
    ) {
        let wrapped = candidates.len() > 1;
        for candidate in candidates {
            match candidate.outcome {
                Ok(trajectory) => {
                    if let Offer::Accepted {
                        report_progress: true,
                    } = writer.offer(trajectory).await
                    {
                        let progress = (writer.accepted() / 10).min(MAX_STREAMING_PROGRESS) as u8;
                        self.context
                            .set_progress(task_id, progress, writer.counts())
                            .await;
                    }
                }
                Err(errors) => {
                    let mut tag = format!("Record {} (line {})", record.index + 1, record.line);
                    if wrapped {
                        tag.push_str(&format!(", trajectory {}", candidate.position));
                    }
                    if let Some(id) = &candidate.trajectory_id {
                        tag.push_str(&format!(" [{}]", id));
                    }
                    tracing::debug!(record = %tag, errors = ?errors, "Rejected record");
                    writer.record_failure(format!("{}: {}", tag, errors.join(", ")));
                }
            }
        }
    }
}
