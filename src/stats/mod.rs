//! Aggregate statistics over stored trajectories.
//!
//! Everything here is a pure function of a [`Dataset`] (trajectories plus
//! their classifications) or of a trajectory slice, so views can be computed
//! concurrently without coordination. Ratios are 0.0 whenever their
//! denominator is zero.

pub mod buckets;
pub mod correlation;
pub mod pass_rate;

use std::collections::HashMap;

use crate::storage::{StoreError, TrajectoryStore};
use crate::trajectory::{ClassificationResult, Trajectory};

pub use buckets::{
    classify_termination, classify_tool_return, reward_stats, termination_stats,
    tool_return_stats, unexpected_tool_contexts, CountRatio, RewardStats, TerminationClass,
    TerminationStats, ToolReturnClass, ToolReturnStats, UnexpectedToolContexts,
};
pub use correlation::{
    kendall_tau, process_reward_correlation, CorrelationReport, Interpretation, KendallTau,
    Strategy,
};
pub use pass_rate::{
    epoch_stats, iteration_stats, overview, pass_at_1, pass_at_1_macro, pass_at_k,
    question_page, question_stats, training_runs, DifficultyTier, Overview, QuestionPage,
    QuestionStats,
};

/// Trajectories together with the success verdict of their classifications.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    trajectories: Vec<Trajectory>,
    analyses: Vec<ClassificationResult>,
    verdicts: HashMap<String, bool>,
}

impl Dataset {
    pub fn new(trajectories: Vec<Trajectory>, analyses: Vec<ClassificationResult>) -> Self {
        let verdicts = analyses
            .iter()
            .map(|a| (a.trajectory_id.clone(), a.is_success))
            .collect();
        Self {
            trajectories,
            analyses,
            verdicts,
        }
    }

    /// Snapshot of every trajectory and classification in the store.
    pub async fn load(store: &dyn TrajectoryStore) -> Result<Self, StoreError> {
        let trajectories = store.list_all().await?;
        let analyses = store.list_analyses().await?;
        Ok(Self::new(trajectories, analyses))
    }

    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }

    pub fn analyses(&self) -> &[ClassificationResult] {
        &self.analyses
    }

    /// The stored classification verdict, or `reward > 0` when unclassified.
    pub fn success(&self, trajectory: &Trajectory) -> bool {
        self.verdicts
            .get(&trajectory.trajectory_id)
            .copied()
            .unwrap_or(trajectory.reward > 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }
}

/// `num / den`, or 0.0 when `den` is zero.
pub fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Mean of `values`, or 0.0 when empty.
pub fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Rounds to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
