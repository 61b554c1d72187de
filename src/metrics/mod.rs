//! Prometheus metrics for ingestion runs.
//!
//! # Example
//!
//! ```
//! use prometheus::Registry;
//! use traj_lens::metrics::{export_metrics, IngestMetrics};
//!
//! let registry = Registry::new();
//! let metrics = IngestMetrics::new(&registry).expect("register");
//! metrics.records_imported.inc();
//! assert!(export_metrics(&registry).contains("traj_lens_records_imported_total 1"));
//! ```

pub mod prometheus;

pub use self::prometheus::{export_metrics, IngestMetrics};
