//! Deduplication and batched writes.
//!
//! The writer snapshots the known ids once, when it is created. Candidates
//! matching the snapshot or an id already accepted in this run are counted
//! as skipped. Survivors accumulate until `batch_size` and are handed to the
//! store in one `insert_batch` call.
//!
//! A failed flush marks every record of that batch as failed and the run
//! continues; batches flushed earlier stay committed. Ids of a failed batch
//! leave the seen set, so a later copy in the same run is retried. The snapshot is never
//! refreshed, so two runs ingesting overlapping ids at the same time can both
//! accept an id; the store's primary key then fails the later batch.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::progress::ProgressCounters;
use crate::metrics::IngestMetrics;
use crate::storage::{StoreError, TrajectoryStore};
use crate::trajectory::Trajectory;

/// Outcome counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What happened to an offered trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued for the next flush. `report_progress` is set every
    /// `progress_every` accepted records.
    Accepted { report_progress: bool },
    Duplicate,
}

pub struct BatchWriter<'a> {
    store: &'a dyn TrajectoryStore,
    existing: HashSet<String>,
    seen: HashSet<String>,
    batch: Vec<Trajectory>,
    batch_size: usize,
    progress_every: usize,
    accepted: usize,
    flushed_offset: usize,
    counts: WriteCounts,
    errors: Vec<String>,
    counters: ProgressCounters,
    metrics: Option<&'a IngestMetrics>,
}

impl<'a> BatchWriter<'a> {
    /// Loads the existing-id snapshot. This is the only store read of a run.
    pub async fn new(
        store: &'a dyn TrajectoryStore,
        batch_size: usize,
        progress_every: usize,
    ) -> Result<BatchWriter<'a>, StoreError> {
        let existing = store.exists_batch().await?;
        tracing::debug!(known_ids = existing.len(), "Loaded existing trajectory ids");

        Ok(Self {
            store,
            existing,
            seen: HashSet::new(),
            batch: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            progress_every: progress_every.max(1),
            accepted: 0,
            flushed_offset: 0,
            counts: WriteCounts::default(),
            errors: Vec::new(),
            counters: ProgressCounters::new(),
            metrics: None,
        })
    }

    /// Mirrors counts into shared progress counters.
    pub fn with_counters(mut self, counters: ProgressCounters) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_metrics(mut self, metrics: &'a IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queues `trajectory` unless its id is already known, flushing when the
    /// batch is full.
    pub async fn offer(&mut self, trajectory: Trajectory) -> Offer {
        let id = &trajectory.trajectory_id;
        if self.existing.contains(id) || self.seen.contains(id) {
            self.counts.skipped += 1;
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = self.metrics {
                m.records_skipped.inc();
            }
            return Offer::Duplicate;
        }

        self.seen.insert(id.clone());
        self.batch.push(trajectory);
        self.accepted += 1;

        if self.batch.len() >= self.batch_size {
            self.flush().await;
        }

        Offer::Accepted {
            report_progress: self.accepted % self.progress_every == 0,
        }
    }

    /// Records a failure that happened before a candidate reached the writer.
    pub fn record_failure(&mut self, error: String) {
        self.counts.failed += 1;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = self.metrics {
            m.records_failed.inc();
        }
        self.errors.push(error);
    }

    /// Writes the pending batch, if any.
    pub async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let size = self.batch.len();
        let offset = self.flushed_offset;
        let started = Instant::now();
        let result = self.store.insert_batch(&self.batch).await;
        let elapsed = started.elapsed().as_secs_f64();

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = self.metrics {
            m.record_flush(result.is_ok(), elapsed);
        }

        match result {
            Ok(()) => {
                self.counts.imported += size;
                self.counters.imported.fetch_add(size, Ordering::Relaxed);
                if let Some(m) = self.metrics {
                    m.records_imported.inc_by(size as u64);
                }
                tracing::info!(offset, size, elapsed_ms = (elapsed * 1000.0) as u64, "Flushed batch");
            }
            Err(e) => {
                tracing::warn!(offset, size, error = %e, "Batch flush failed");
                for t in &self.batch {
                    self.seen.remove(&t.trajectory_id);
                }
                self.counts.failed += size;
                self.counters.failed.fetch_add(size, Ordering::Relaxed);
                if let Some(m) = self.metrics {
                    m.records_failed.inc_by(size as u64);
                }
                self.errors.push(format!(
                    "Batch at offset {} ({} records) failed to write: {}",
                    offset, size, e
                ));
            }
        }

        self.flushed_offset += size;
        self.batch.clear();
    }

    /// Flushes the remainder and returns the run's counts and errors.
    pub async fn finish(mut self) -> (WriteCounts, Vec<String>) {
        self.flush().await;
        (self.counts, self.errors)
    }

    pub fn counts(&self) -> WriteCounts {
        self.counts
    }

    /// Trajectories accepted so far, flushed or pending.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTrajectoryStore;

    fn traj(id: &str) -> Trajectory {
        Trajectory::new(id, "q")
    }

    #[tokio::test]
    async fn test_flushes_at_threshold() {
        let store = MemoryTrajectoryStore::new();
        let mut writer = BatchWriter::new(&store, 2, 100).await.expect("writer");

        writer.offer(traj("a")).await;
        assert_eq!(writer.pending(), 1);
        writer.offer(traj("b")).await;
        assert_eq!(writer.pending(), 0);
        assert_eq!(store.insert_calls(), 1);

        writer.offer(traj("c")).await;
        let (counts, errors) = writer.finish().await;
        assert_eq!(counts.imported, 3);
        assert!(errors.is_empty());
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_skips_known_and_in_run_duplicates() {
        let store = MemoryTrajectoryStore::new();
        store.insert_batch(&[traj("old")]).await.expect("seed");

        let mut writer = BatchWriter::new(&store, 10, 100).await.expect("writer");
        assert_eq!(writer.offer(traj("old")).await, Offer::Duplicate);
        assert!(matches!(writer.offer(traj("new")).await, Offer::Accepted { .. }));
        assert_eq!(writer.offer(traj("new")).await, Offer::Duplicate);

        let (counts, _) = writer.finish().await;
        assert_eq!(
            counts,
            WriteCounts {
                imported: 1,
                skipped: 2,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failed_flush_is_recorded_and_run_continues() {
        let store = MemoryTrajectoryStore::new().fail_insert_calls([1]);
        let metrics = IngestMetrics::detached().expect("metrics");
        let mut writer = BatchWriter::new(&store, 2, 100)
            .await
            .expect("writer")
            .with_metrics(&metrics);

        for id in ["a", "b", "c", "d", "e"] {
            writer.offer(traj(id)).await;
        }
        let (counts, errors) = writer.finish().await;

        assert_eq!(counts.imported, 3);
        assert_eq!(counts.failed, 2);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("offset 2 (2 records)"));
        assert!(store.get("a").await.expect("get").is_some());
        assert!(store.get("c").await.expect("get").is_none());
        assert_eq!(metrics.batches_flushed.with_label_values(&["error"]).get(), 1);
        assert_eq!(metrics.records_imported.get(), 3);
    }

    #[tokio::test]
    async fn test_progress_ticks() {
        let store = MemoryTrajectoryStore::new();
        let mut writer = BatchWriter::new(&store, 100, 2).await.expect("writer");
        let first = writer.offer(traj("a")).await;
        let second = writer.offer(traj("b")).await;
        assert_eq!(first, Offer::Accepted { report_progress: false });
        assert_eq!(second, Offer::Accepted { report_progress: true });
    }

    #[tokio::test]
    async fn test_failed_batch_ids_can_be_offered_again() {
        let store = MemoryTrajectoryStore::new().fail_insert_calls([0]);
        let mut writer = BatchWriter::new(&store, 2, 100).await.expect("writer");

        writer.offer(traj("a")).await;
        writer.offer(traj("b")).await;
        assert_eq!(writer.counts().failed, 2);

        assert!(matches!(writer.offer(traj("a")).await, Offer::Accepted { .. }));
        let (counts, errors) = writer.finish().await;
        assert_eq!(
            counts,
            WriteCounts {
                imported: 1,
                skipped: 0,
                failed: 2
            }
        );
        assert_eq!(errors.len(), 1);
        assert!(store.get("a").await.expect("get").is_some());
    }
}
