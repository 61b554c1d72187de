//! Classification of stored trajectories.
//!
//! The service owns a [`FailureClassifier`] and a store handle. Each analysis
//! produces one [`ClassificationResult`] that replaces any earlier one for the
//! same trajectory.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::classifier::{ClassifierConfig, FailureClassifier, NumericContext};
use super::suggestion::{suggest, ANALYSIS_ERROR_CATEGORY};
use crate::error::AnalysisError;
use crate::stats::{self, Dataset};
use crate::storage::TrajectoryStore;
use crate::trajectory::{ClassificationResult, Trajectory};

/// Number of failure categories listed in a report.
const TOP_FAILURES: usize = 5;

impl From<&Trajectory> for NumericContext {
    fn from(t: &Trajectory) -> Self {
        Self {
            reward: t.reward,
            exec_time: t.exec_time,
            step_count: t.step_count(),
        }
    }
}

/// Share of one category among failed classifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureShare {
    pub category: String,
    pub count: usize,
    /// Percentage of all failed results, 0-100.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopFailure {
    pub category: String,
    pub count: usize,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub total_count: usize,
    pub pass_at_1: f64,
    pub pass_at_k: f64,
    pub failures: Vec<FailureShare>,
    pub top_failure_reasons: Vec<TopFailure>,
}

pub struct AnalysisService {
    store: Arc<dyn TrajectoryStore>,
    classifier: FailureClassifier,
    success_threshold: f64,
}

impl AnalysisService {
    pub fn new(
        store: Arc<dyn TrajectoryStore>,
        config: ClassifierConfig,
        success_threshold: f64,
    ) -> Result<Self, AnalysisError> {
        Ok(Self {
            store,
            classifier: FailureClassifier::new(config)?,
            success_threshold,
        })
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Classifies one trajectory without touching the store.
    pub fn classify(&self, trajectory: &Trajectory) -> ClassificationResult {
        let context = NumericContext::from(trajectory);
        let diagnosis = self
            .classifier
            .classify(&trajectory.chat_completions, &context);
        let category = diagnosis.category.label();
        let root_cause = diagnosis.root_cause.label();

        ClassificationResult {
            trajectory_id: trajectory.trajectory_id.clone(),
            is_success: trajectory.reward > self.success_threshold,
            category: category.to_string(),
            root_cause: root_cause.to_string(),
            suggestion: suggest(category, root_cause).to_string(),
            analyzed_at: Utc::now(),
        }
    }

    /// Classifies a stored trajectory and persists the result.
    pub async fn analyze_trajectory(
        &self,
        trajectory_id: &str,
    ) -> Result<ClassificationResult, AnalysisError> {
        let trajectory = self
            .store
            .get(trajectory_id)
            .await?
            .ok_or_else(|| AnalysisError::NotFound(trajectory_id.to_string()))?;

        let result = self.classify(&trajectory);
        self.store.save_analysis(&result).await?;
        tracing::debug!(
            trajectory_id,
            category = %result.category,
            is_success = result.is_success,
            "Trajectory analyzed"
        );
        Ok(result)
    }

    /// Analyzes each id in turn. A failure for one id yields an
    /// `Analysis Error` result for it instead of aborting the batch.
    pub async fn batch_analyze(&self, trajectory_ids: &[String]) -> Vec<ClassificationResult> {
        let mut results = Vec::with_capacity(trajectory_ids.len());
        for id in trajectory_ids {
            match self.analyze_trajectory(id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(trajectory_id = %id, error = %e, "Analysis failed");
                    results.push(analysis_error(id, &e));
                }
            }
        }
        results
    }

    /// Analyzes every stored trajectory.
    pub async fn analyze_all(&self) -> Result<Vec<ClassificationResult>, AnalysisError> {
        let ids: Vec<String> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|t| t.trajectory_id)
            .collect();

        tracing::info!(count = ids.len(), "Analyzing trajectories");
        let results = self.batch_analyze(&ids).await;
        let errors = results
            .iter()
            .filter(|r| r.category == ANALYSIS_ERROR_CATEGORY)
            .count();
        tracing::info!(analyzed = results.len() - errors, errors, "Analysis finished");
        Ok(results)
    }

    pub async fn get_analysis(
        &self,
        trajectory_id: &str,
    ) -> Result<Option<ClassificationResult>, AnalysisError> {
        Ok(self.store.get_analysis(trajectory_id).await?)
    }

    /// Failed classifications grouped by category, most frequent first.
    pub async fn failure_distribution(&self) -> Result<Vec<FailureShare>, AnalysisError> {
        let analyses = self.store.list_analyses().await?;
        Ok(failure_distribution(&analyses))
    }

    /// Stored trajectories whose classification has the given category.
    pub async fn filter_by_category(
        &self,
        category: &str,
    ) -> Result<Vec<Trajectory>, AnalysisError> {
        let mut trajectories = Vec::new();
        for analysis in self.store.list_analyses().await? {
            if analysis.category != category {
                continue;
            }
            if let Some(t) = self.store.get(&analysis.trajectory_id).await? {
                trajectories.push(t);
            }
        }
        Ok(trajectories)
    }

    pub async fn report(&self) -> Result<AnalysisReport, AnalysisError> {
        let dataset = Dataset::load(self.store.as_ref()).await?;
        let overview = stats::overview(&dataset);
        let failures = failure_distribution(dataset.analyses());

        let top_failure_reasons = failures
            .iter()
            .take(TOP_FAILURES)
            .map(|f| TopFailure {
                category: f.category.clone(),
                count: f.count,
                suggestion: suggest(&f.category, "").to_string(),
            })
            .collect();

        Ok(AnalysisReport {
            total_count: overview.total_count,
            pass_at_1: overview.pass_at_1,
            pass_at_k: overview.pass_at_k,
            failures,
            top_failure_reasons,
        })
    }
}

fn analysis_error(trajectory_id: &str, error: &AnalysisError) -> ClassificationResult {
    let root_cause = error.to_string();
    ClassificationResult {
        trajectory_id: trajectory_id.to_string(),
        is_success: false,
        category: ANALYSIS_ERROR_CATEGORY.to_string(),
        suggestion: suggest(ANALYSIS_ERROR_CATEGORY, &root_cause).to_string(),
        root_cause,
        analyzed_at: Utc::now(),
    }
}

fn failure_distribution(analyses: &[ClassificationResult]) -> Vec<FailureShare> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut total = 0;
    for a in analyses.iter().filter(|a| !a.is_success) {
        *counts.entry(a.category.as_str()).or_default() += 1;
        total += 1;
    }

    let mut shares: Vec<FailureShare> = counts
        .into_iter()
        .map(|(category, count)| FailureShare {
            category: category.to_string(),
            count,
            percentage: stats::ratio(count, total) * 100.0,
        })
        .collect();
    // Ties broken by name so reports are stable.
    shares.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTrajectoryStore;
    use crate::trajectory::Message;

    async fn service_with(trajectories: Vec<Trajectory>) -> AnalysisService {
        let store = Arc::new(MemoryTrajectoryStore::new());
        store
            .insert_batch(&trajectories)
            .await
            .expect("insert should work");
        AnalysisService::new(store, ClassifierConfig::default(), 0.5).expect("service")
    }

    fn hanging(id: &str, data_id: &str, reward: f64) -> Trajectory {
        Trajectory::new(id, data_id)
            .with_reward(reward)
            .with_transcript(vec![Message::user("q"), Message::assistant("thinking...")])
    }

    #[tokio::test]
    async fn test_analyze_persists_and_replaces() {
        let service = service_with(vec![hanging("t1", "q1", 0.0)]).await;

        let first = service.analyze_trajectory("t1").await.expect("analysis");
        assert!(!first.is_success);
        assert_eq!(first.category, "1. Trajectory Anomaly (Truncated)");
        assert!(first.suggestion.contains("context length"));

        service.analyze_trajectory("t1").await.expect("analysis");
        let all = service.store.list_analyses().await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_success_threshold_is_strict() {
        let service = service_with(vec![]).await;
        assert!(!service.classify(&hanging("a", "q", 0.5)).is_success);
        assert!(service.classify(&hanging("b", "q", 0.51)).is_success);
    }

    #[tokio::test]
    async fn test_batch_analyze_reports_missing_ids() {
        let service = service_with(vec![hanging("t1", "q1", 1.0)]).await;
        let results = service
            .batch_analyze(&["t1".to_string(), "ghost".to_string()])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_success);
        assert_eq!(results[1].category, ANALYSIS_ERROR_CATEGORY);
        assert!(results[1].root_cause.contains("ghost"));
        assert!(service.get_analysis("ghost").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn test_failure_distribution_and_report() {
        let mut trajectories = vec![
            hanging("t1", "q1", 0.0),
            hanging("t2", "q1", 0.0),
            hanging("t3", "q2", 1.0),
        ];
        trajectories.push(Trajectory::new("t4", "q2").with_reward(0.0));
        let service = service_with(trajectories).await;
        service.analyze_all().await.expect("analysis");

        let dist = service.failure_distribution().await.expect("distribution");
        assert_eq!(dist.len(), 2);
        assert_eq!(dist[0].category, "1. Trajectory Anomaly (Truncated)");
        assert_eq!(dist[0].count, 2);
        assert!((dist[0].percentage - 66.666).abs() < 0.01);

        let report = service.report().await.expect("report");
        assert_eq!(report.total_count, 4);
        assert!((report.pass_at_1 - 0.25).abs() < 1e-9);
        assert!((report.pass_at_k - 0.5).abs() < 1e-9);
        assert_eq!(report.top_failure_reasons.len(), 2);
        assert!(report.top_failure_reasons[1].suggestion.contains("examples"));

        let truncated = service
            .filter_by_category("1. Trajectory Anomaly (Truncated)")
            .await
            .expect("filter");
        assert_eq!(truncated.len(), 2);
    }

    #[tokio::test]
    async fn test_distribution_empty_without_failures() {
        let service = service_with(vec![hanging("t1", "q1", 1.0)]).await;
        service.analyze_all().await.expect("analysis");
        assert!(service.failure_distribution().await.expect("dist").is_empty());
    }
}
