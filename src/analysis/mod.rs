//! Failure analysis.
//!
//! - [`classifier`] assigns a failure category and root cause to a transcript
//! - [`suggestion`] maps a diagnosis to remediation text
//! - [`service`] classifies stored trajectories and aggregates the results

pub mod classifier;
pub mod service;
pub mod suggestion;

pub use classifier::{
    ClassifierConfig, Diagnosis, FailureCategory, FailureClassifier, MarkerSet, NumericContext,
    RootCause, Rule,
};
pub use service::{AnalysisReport, AnalysisService, FailureShare, TopFailure};
pub use suggestion::{suggest, ANALYSIS_ERROR_CATEGORY};
