//! Pass rates, question difficulty and training progress.
//!
//! Two Pass@1 figures are kept apart on purpose:
//! - [`pass_at_1`] is the micro mean over all trajectories
//! - [`pass_at_1_macro`] is the mean of the per-question success rates
//!
//! Questions with many attempts dominate the micro figure; the macro figure
//! weighs every question equally. [`Overview`] reports both.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{mean, ratio, round_to, Dataset};
use crate::trajectory::Trajectory;

/// Tier of a question by its success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyTier {
    Easy,
    Medium,
    Hard,
}

impl DifficultyTier {
    pub fn from_rate(rate: f64) -> Self {
        if rate >= 0.7 {
            DifficultyTier::Easy
        } else if rate >= 0.4 {
            DifficultyTier::Medium
        } else {
            DifficultyTier::Hard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyTier::Easy => "easy",
            DifficultyTier::Medium => "medium",
            DifficultyTier::Hard => "hard",
        }
    }
}

fn group_by_question<'a, I>(trajectories: I) -> BTreeMap<&'a str, Vec<&'a Trajectory>>
where
    I: IntoIterator<Item = &'a Trajectory>,
{
    let mut groups: BTreeMap<&str, Vec<&Trajectory>> = BTreeMap::new();
    for t in trajectories {
        groups.entry(t.data_id.as_str()).or_default().push(t);
    }
    groups
}

/// Fraction of all trajectories that succeeded.
pub fn pass_at_1(ds: &Dataset) -> f64 {
    let successes = ds.trajectories().iter().filter(|t| ds.success(t)).count();
    ratio(successes, ds.trajectories().len())
}

/// Mean over questions of the per-question success rate.
pub fn pass_at_1_macro(ds: &Dataset) -> f64 {
    let groups = group_by_question(ds.trajectories());
    mean(groups.values().map(|group| {
        let successes = group.iter().filter(|t| ds.success(t)).count();
        ratio(successes, group.len())
    }))
}

/// Fraction of questions with at least one successful trajectory.
pub fn pass_at_k(ds: &Dataset) -> f64 {
    let groups = group_by_question(ds.trajectories());
    let solved = groups
        .values()
        .filter(|group| group.iter().any(|t| ds.success(t)))
        .count();
    ratio(solved, groups.len())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub pass_at_1: f64,
    pub pass_at_1_macro: f64,
    pub pass_at_k: f64,
    pub avg_reward: f64,
    pub avg_exec_time: f64,
}

pub fn overview(ds: &Dataset) -> Overview {
    let trajectories = ds.trajectories();
    let success_count = trajectories.iter().filter(|t| ds.success(t)).count();
    Overview {
        total_count: trajectories.len(),
        success_count,
        failure_count: trajectories.len() - success_count,
        pass_at_1: pass_at_1(ds),
        pass_at_1_macro: pass_at_1_macro(ds),
        pass_at_k: pass_at_k(ds),
        avg_reward: mean(trajectories.iter().map(|t| t.reward)),
        avg_exec_time: mean(trajectories.iter().map(|t| t.exec_time)),
    }
}

/// One row of the question table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionStats {
    pub data_id: String,
    /// Question text of the first trajectory seen for this id.
    pub question: String,
    pub success_count: usize,
    pub total_count: usize,
    pub rate: f64,
    pub difficulty: DifficultyTier,
}

/// Per-question success, sorted by `data_id`.
pub fn question_stats(ds: &Dataset) -> Vec<QuestionStats> {
    group_by_question(ds.trajectories())
        .into_iter()
        .map(|(data_id, group)| {
            let question = group
                .first()
                .map(|t| t.question())
                .filter(|q| !q.is_empty())
                .unwrap_or("N/A");
            let success_count = group.iter().filter(|t| ds.success(t)).count();
            let rate = ratio(success_count, group.len());
            QuestionStats {
                data_id: data_id.to_string(),
                question: question.to_string(),
                success_count,
                total_count: group.len(),
                rate,
                difficulty: DifficultyTier::from_rate(rate),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionPage {
    pub data: Vec<QuestionStats>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// One page of the question table. Pages start at 1.
pub fn question_page(ds: &Dataset, page: usize, page_size: usize) -> QuestionPage {
    let page = page.max(1);
    let rows = question_stats(ds);
    let total = rows.len();
    let data = rows
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .collect();
    QuestionPage {
        data,
        total,
        page,
        page_size,
    }
}

/// Pass rates of one training slice. Success here is always `reward > 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingRates {
    pub pass_at_1: f64,
    pub pass_at_k: f64,
    pub avg_reward: f64,
    pub success_rate: f64,
}

impl TrainingRates {
    fn from_slice(slice: &[&Trajectory]) -> Self {
        let successes = slice.iter().filter(|t| t.reward > 0.0).count();
        let groups = group_by_question(slice.iter().copied());
        let solved = groups
            .values()
            .filter(|group| group.iter().any(|t| t.reward > 0.0))
            .count();
        let success_rate = ratio(successes, slice.len());

        Self {
            pass_at_1: round_to(success_rate, 4),
            pass_at_k: round_to(ratio(solved, groups.len()), 4),
            avg_reward: round_to(mean(slice.iter().map(|t| t.reward)), 4),
            success_rate: round_to(success_rate, 4),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: i64,
    #[serde(flatten)]
    pub rates: TrainingRates,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingEpochs {
    pub training_id: String,
    pub epochs: Vec<EpochStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStats {
    pub iteration: i64,
    #[serde(flatten)]
    pub rates: TrainingRates,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochIterations {
    pub epoch_id: i64,
    pub iterations: Vec<IterationStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationReport {
    pub training_id: String,
    pub epochs: Vec<EpochIterations>,
}

/// Sorted, non-empty training ids.
pub fn training_runs(trajectories: &[Trajectory]) -> Vec<String> {
    let mut ids: Vec<String> = trajectories
        .iter()
        .filter(|t| !t.training_id.is_empty())
        .map(|t| t.training_id.clone())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Groups trajectories by epoch, skipping epoch 0 (untrained baseline rows).
fn by_epoch<'a, I>(trajectories: I) -> BTreeMap<i64, Vec<&'a Trajectory>>
where
    I: IntoIterator<Item = &'a Trajectory>,
{
    let mut epochs: BTreeMap<i64, Vec<&Trajectory>> = BTreeMap::new();
    for t in trajectories.into_iter().filter(|t| t.epoch_id != 0) {
        epochs.entry(t.epoch_id).or_default().push(t);
    }
    epochs
}

/// Per-epoch rates for each training run. An empty `training_ids` selects all runs.
pub fn epoch_stats(trajectories: &[Trajectory], training_ids: &[String]) -> Vec<TrainingEpochs> {
    let mut runs: BTreeMap<&str, Vec<&Trajectory>> = BTreeMap::new();
    for t in trajectories.iter().filter(|t| !t.training_id.is_empty()) {
        if training_ids.is_empty() || training_ids.contains(&t.training_id) {
            runs.entry(t.training_id.as_str()).or_default().push(t);
        }
    }

    runs.into_iter()
        .filter_map(|(training_id, run)| {
            let epochs: Vec<EpochStats> = by_epoch(run)
                .into_iter()
                .map(|(epoch, slice)| EpochStats {
                    epoch,
                    rates: TrainingRates::from_slice(&slice),
                })
                .collect();
            (!epochs.is_empty()).then(|| TrainingEpochs {
                training_id: training_id.to_string(),
                epochs,
            })
        })
        .collect()
}

/// Per-iteration rates inside each epoch of one run. An empty `epoch_ids` selects all epochs.
pub fn iteration_stats(
    trajectories: &[Trajectory],
    training_id: &str,
    epoch_ids: &[i64],
) -> IterationReport {
    let run = trajectories
        .iter()
        .filter(|t| t.training_id == training_id)
        .filter(|t| epoch_ids.is_empty() || epoch_ids.contains(&t.epoch_id));

    let epochs = by_epoch(run)
        .into_iter()
        .map(|(epoch_id, slice)| {
            let mut iterations: BTreeMap<i64, Vec<&Trajectory>> = BTreeMap::new();
            for t in slice {
                iterations.entry(t.iteration_id).or_default().push(t);
            }
            EpochIterations {
                epoch_id,
                iterations: iterations
                    .into_iter()
                    .map(|(iteration, slice)| IterationStats {
                        iteration,
                        rates: TrainingRates::from_slice(&slice),
                    })
                    .collect(),
            }
        })
        .collect();

    IterationReport {
        training_id: training_id.to_string(),
        epochs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traj(id: &str, data_id: &str, reward: f64) -> Trajectory {
        Trajectory::new(id, data_id).with_reward(reward)
    }

    fn trained(id: &str, data_id: &str, epoch: i64, iteration: i64, reward: f64) -> Trajectory {
        let mut t = traj(id, data_id, reward);
        t.training_id = "run-a".to_string();
        t.epoch_id = epoch;
        t.iteration_id = iteration;
        t
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(DifficultyTier::from_rate(0.7), DifficultyTier::Easy);
        assert_eq!(DifficultyTier::from_rate(0.69), DifficultyTier::Medium);
        assert_eq!(DifficultyTier::from_rate(0.4), DifficultyTier::Medium);
        assert_eq!(DifficultyTier::from_rate(0.39), DifficultyTier::Hard);
    }

    #[test]
    fn test_micro_and_macro_differ() {
        // q1: 3/3 succeed, q2: 0/1 succeed.
        let ds = Dataset::new(
            vec![
                traj("a", "q1", 1.0),
                traj("b", "q1", 1.0),
                traj("c", "q1", 1.0),
                traj("d", "q2", 0.0),
            ],
            Vec::new(),
        );
        assert!((pass_at_1(&ds) - 0.75).abs() < 1e-9);
        assert!((pass_at_1_macro(&ds) - 0.5).abs() < 1e-9);
        assert!((pass_at_k(&ds) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_dataset_is_zero() {
        let ds = Dataset::default();
        let o = overview(&ds);
        assert_eq!(o.total_count, 0);
        assert_eq!(o.pass_at_1, 0.0);
        assert_eq!(o.pass_at_1_macro, 0.0);
        assert_eq!(o.pass_at_k, 0.0);
        assert_eq!(o.avg_reward, 0.0);
        assert!(question_stats(&ds).is_empty());
    }

    #[test]
    fn test_question_table_sorted_and_paged() {
        let mut first = traj("z1", "q2", 1.0);
        first.task.question = "What is 2+2?".to_string();
        let ds = Dataset::new(
            vec![
                first,
                traj("z2", "q2", 0.0),
                traj("y1", "q1", 0.0),
                traj("x1", "q3", 1.0),
            ],
            Vec::new(),
        );

        let rows = question_stats(&ds);
        let ids: Vec<&str> = rows.iter().map(|r| r.data_id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2", "q3"]);
        assert_eq!(rows[0].question, "N/A");
        assert_eq!(rows[1].question, "What is 2+2?");
        assert_eq!(rows[1].difficulty, DifficultyTier::Medium);
        assert_eq!(rows[2].difficulty, DifficultyTier::Easy);

        let page = question_page(&ds, 2, 2);
        assert_eq!(page.total, 3);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].data_id, "q3");
        assert!(question_page(&ds, 5, 2).data.is_empty());
    }

    #[test]
    fn test_epoch_stats_skip_epoch_zero() {
        let trajectories = vec![
            trained("a", "q1", 0, 1, 1.0),
            trained("b", "q1", 1, 1, 1.0),
            trained("c", "q1", 1, 2, 0.0),
            trained("d", "q2", 1, 2, 0.0),
            trained("e", "q2", 2, 1, 0.5),
        ];
        assert_eq!(training_runs(&trajectories), vec!["run-a".to_string()]);

        let runs = epoch_stats(&trajectories, &[]);
        assert_eq!(runs.len(), 1);
        let epochs = &runs[0].epochs;
        assert_eq!(epochs.iter().map(|e| e.epoch).collect::<Vec<_>>(), vec![1, 2]);
        assert!((epochs[0].rates.pass_at_1 - 0.3333).abs() < 1e-9);
        assert!((epochs[0].rates.pass_at_k - 0.5).abs() < 1e-9);
        assert!((epochs[0].rates.avg_reward - 0.3333).abs() < 1e-9);

        assert!(epoch_stats(&trajectories, &["other".to_string()]).is_empty());
    }

    #[test]
    fn test_iteration_stats() {
        let trajectories = vec![
            trained("b", "q1", 1, 1, 1.0),
            trained("c", "q1", 1, 2, 0.0),
            trained("e", "q2", 2, 1, 0.5),
        ];
        let report = iteration_stats(&trajectories, "run-a", &[1]);
        assert_eq!(report.epochs.len(), 1);
        let iterations = &report.epochs[0].iterations;
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0].rates.success_rate, 1.0);
        assert_eq!(iterations[1].rates.success_rate, 0.0);

        let json = serde_json::to_value(&iterations[0]).expect("serializes");
        assert_eq!(json["iteration"], 1);
        assert!(json.get("pass_at_k").is_some());
    }
}
