//! Prometheus metric definitions for ingestion.
//!
//! Metrics live on an [`IngestMetrics`] value registered against a registry
//! the caller owns, so concurrent runs and tests never share counters.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Counters and timings for trajectory imports.
#[derive(Clone)]
pub struct IngestMetrics {
    pub records_imported: IntCounter,
    pub records_skipped: IntCounter,
    pub records_failed: IntCounter,
    /// Batch flushes labelled by `status` (`ok` / `error`).
    pub batches_flushed: IntCounterVec,
    pub flush_duration: Histogram,
}

impl IngestMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let records_imported = IntCounter::new(
            "traj_lens_records_imported_total",
            "Trajectories written to the store",
        )?;
        let records_skipped = IntCounter::new(
            "traj_lens_records_skipped_total",
            "Records skipped as duplicates of known trajectory ids",
        )?;
        let records_failed = IntCounter::new(
            "traj_lens_records_failed_total",
            "Records rejected by parsing, validation or a failed flush",
        )?;
        let batches_flushed = IntCounterVec::new(
            Opts::new("traj_lens_batches_flushed_total", "Batch flushes by outcome"),
            &["status"],
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "traj_lens_flush_duration_seconds",
                "Time spent writing one batch to the store",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(records_imported.clone()))?;
        registry.register(Box::new(records_skipped.clone()))?;
        registry.register(Box::new(records_failed.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            records_imported,
            records_skipped,
            records_failed,
            batches_flushed,
            flush_duration,
        })
    }

    /// Metrics registered on a private registry, for callers that never export.
    pub fn detached() -> Result<Self, prometheus::Error> {
        Self::new(&Registry::new())
    }

    pub fn record_flush(&self, ok: bool, seconds: f64) {
        let status = if ok { "ok" } else { "error" };
        self.batches_flushed.with_label_values(&[status]).inc();
        self.flush_duration.observe(seconds);
    }
}

/// Renders every metric in `registry` in the Prometheus text format.
pub fn export_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
