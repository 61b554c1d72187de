//! Import bookkeeping owned by the caller.
//!
//! An [`ImportContext`] tracks in-flight and finished import tasks plus a
//! bounded history of completed runs. Each service (or test) creates its own,
//! so independent runs never share state.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::sniffer::StreamFormat;
use super::writer::WriteCounts;

/// Lifecycle state of an import task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Processing,
    Completed,
    Failed,
}

/// Structured outcome of one ingestion call.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    /// True when at least one record was imported or recognised as known.
    pub success: bool,
    pub task_id: String,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    /// Per-record problems, each tagged with its record or line.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub status: ImportStatus,
    /// 0-100.
    pub progress: u8,
    pub message: String,
    pub format: Option<StreamFormat>,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportResult {
    pub fn processing(task_id: impl Into<String>) -> Self {
        Self {
            success: false,
            task_id: task_id.into(),
            imported_count: 0,
            skipped_count: 0,
            failed_count: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            status: ImportStatus::Processing,
            progress: 0,
            message: String::new(),
            format: None,
            file_name: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn apply_counts(&mut self, counts: WriteCounts) {
        self.imported_count = counts.imported;
        self.skipped_count = counts.skipped;
        self.failed_count = counts.failed;
        self.success = counts.imported > 0 || counts.skipped > 0;
    }

    /// Marks the task finished with the given status.
    pub fn finish(&mut self, status: ImportStatus) {
        self.status = status;
        self.progress = 100;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the task failed as a whole with one error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
        self.status = ImportStatus::Failed;
        self.completed_at = Some(Utc::now());
    }
}

/// Summary of a finished run kept in the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportHistoryEntry {
    pub task_id: String,
    pub file_name: String,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub status: ImportStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&ImportResult> for ImportHistoryEntry {
    fn from(result: &ImportResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            file_name: result.file_name.clone().unwrap_or_else(|| "<inline>".to_string()),
            imported_count: result.imported_count,
            skipped_count: result.skipped_count,
            failed_count: result.failed_count,
            status: result.status,
            created_at: result.created_at,
            completed_at: result.completed_at,
        }
    }
}

#[derive(Debug)]
pub struct ImportContext {
    tasks: RwLock<HashMap<String, ImportResult>>,
    history: RwLock<VecDeque<ImportHistoryEntry>>,
    history_limit: usize,
}

impl Default for ImportContext {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ImportContext {
    pub fn new(history_limit: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            history_limit,
        }
    }

    /// Registers a task as in flight.
    pub async fn begin(&self, result: &ImportResult) {
        self.tasks
            .write()
            .await
            .insert(result.task_id.clone(), result.clone());
    }

    pub async fn set_progress(&self, task_id: &str, progress: u8, counts: WriteCounts) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.progress = progress.min(100);
            task.apply_counts(counts);
        }
    }

    /// Stores the final result and, for completed runs, prepends a history entry.
    pub async fn complete(&self, result: &ImportResult) {
        self.tasks
            .write()
            .await
            .insert(result.task_id.clone(), result.clone());

        if result.status == ImportStatus::Completed {
            let mut history = self.history.write().await;
            history.push_front(ImportHistoryEntry::from(result));
            history.truncate(self.history_limit);
        }
    }

    pub async fn status(&self, task_id: &str) -> Option<ImportResult> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Most recent runs first.
    pub async fn history(&self, limit: usize) -> Vec<ImportHistoryEntry> {
        self.history.read().await.iter().take(limit).cloned().collect()
    }

    /// Removes tasks created more than `max_age` ago; returns how many were removed.
    pub async fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| task.created_at >= cutoff);
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up old import tasks");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(task_id: &str) -> ImportResult {
        let mut r = ImportResult::processing(task_id);
        r.apply_counts(WriteCounts {
            imported: 1,
            skipped: 0,
            failed: 0,
        });
        r.finish(ImportStatus::Completed);
        r
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let ctx = ImportContext::new(10);
        let r = ImportResult::processing("t1");
        ctx.begin(&r).await;
        assert_eq!(
            ctx.status("t1").await.expect("registered").status,
            ImportStatus::Processing
        );

        ctx.set_progress("t1", 40, WriteCounts { imported: 4, skipped: 1, failed: 0 })
            .await;
        let live = ctx.status("t1").await.expect("registered");
        assert_eq!(live.progress, 40);
        assert_eq!(live.imported_count, 4);

        ctx.complete(&completed("t1")).await;
        let done = ctx.status("t1").await.expect("registered");
        assert_eq!(done.status, ImportStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.success);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_most_recent_first() {
        let ctx = ImportContext::new(2);
        for id in ["a", "b", "c"] {
            ctx.complete(&completed(id)).await;
        }
        let history = ctx.history(10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].task_id, "c");
        assert_eq!(history[1].task_id, "b");
    }

    #[tokio::test]
    async fn test_failed_runs_stay_out_of_history() {
        let ctx = ImportContext::new(5);
        let mut r = ImportResult::processing("bad");
        r.fail("File does not exist: /nope");
        ctx.complete(&r).await;
        assert!(ctx.history(5).await.is_empty());
        assert_eq!(ctx.status("bad").await.expect("kept").errors.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_old_tasks() {
        let ctx = ImportContext::new(5);
        let mut old = ImportResult::processing("old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        ctx.begin(&old).await;
        ctx.begin(&ImportResult::processing("fresh")).await;

        let removed = ctx.cleanup_old_tasks(Duration::from_secs(3600)).await;
        assert_eq!(removed, 1);
        assert!(ctx.status("old").await.is_none());
        assert!(ctx.status("fresh").await.is_some());
    }
}
