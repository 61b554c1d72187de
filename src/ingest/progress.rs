//! Background progress monitor for long-running imports.
//!
//! The import loop bumps shared atomic counters; the monitor wakes on a fixed
//! interval and logs a summary. It owns no ingestion state, so cancelling it
//! never affects the import result.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Counter values at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Records produced by the extractor.
    pub extracted: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Batches handed to the store, successful or not.
    pub batches: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Records per second extracted so far.
    pub fn extraction_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.extracted as f64 / secs
        } else {
            0.0
        }
    }
}

/// Shared counters, cloned into the monitor and incremented by the writer.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub extracted: Arc<AtomicUsize>,
    pub imported: Arc<AtomicUsize>,
    pub skipped: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub batches: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            extracted: Arc::new(AtomicUsize::new(0)),
            imported: Arc::new(AtomicUsize::new(0)),
            skipped: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            batches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            extracted: self.extracted.load(Ordering::Relaxed),
            imported: self.imported.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs import progress.
///
/// Call [`ProgressMonitor::stop`] to cancel and join it; dropping it only
/// signals the stop flag.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Starts logging `counters` every `interval`, labelled with `task_id`.
    pub fn start(counters: ProgressCounters, task_id: String, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // first tick fires immediately

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                tracing::info!(
                    task_id = %task_id,
                    extracted = snap.extracted,
                    imported = snap.imported,
                    skipped = snap.skipped,
                    failed = snap.failed,
                    batches = snap.batches,
                    elapsed_secs = snap.elapsed.as_secs(),
                    records_per_sec = format!("{:.1}", snap.extraction_rate()),
                    "Import progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the monitor to stop and waits for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let snap = ProgressCounters::new().snapshot(Instant::now());
        assert_eq!(snap.extracted, 0);
        assert_eq!(snap.imported, 0);
        assert_eq!(snap.skipped, 0);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.batches, 0);
    }

    #[test]
    fn test_clone_shares_state() {
        let counters = ProgressCounters::new();
        let clone = counters.clone();
        counters.imported.fetch_add(7, Ordering::Relaxed);
        assert_eq!(clone.imported.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_extraction_rate_zero_elapsed() {
        let snap = ProgressSnapshot {
            extracted: 10,
            imported: 0,
            skipped: 0,
            failed: 0,
            batches: 0,
            elapsed: Duration::ZERO,
        };
        assert_eq!(snap.extraction_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let counters = ProgressCounters::new();
        counters.extracted.fetch_add(3, Ordering::Relaxed);
        let monitor = ProgressMonitor::start(counters, "task".to_string(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;
    }
}
