//! Bucketed counts: how episodes ended, what tools returned, how rewards fell.

use serde::Serialize;

use super::{mean, ratio, round_to};
use crate::error::preview;
use crate::trajectory::Trajectory;

const QUESTION_PREVIEW_CHARS: usize = 100;

/// A count with its share of the total, rounded to 3 places.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CountRatio {
    pub count: usize,
    pub ratio: f64,
}

impl CountRatio {
    fn of(count: usize, total: usize) -> Self {
        Self {
            count,
            ratio: round_to(ratio(count, total), 3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationClass {
    Finish,
    Timeout,
    Truncation,
    EnvDone,
    Unknown,
}

// Checked in order; the first class with a matching keyword wins.
const TERMINATION_KEYWORDS: &[(TerminationClass, &[&str])] = &[
    (TerminationClass::Finish, &["finish", "completed", "done"]),
    (TerminationClass::Timeout, &["timeout", "timed_out", "time out"]),
    (
        TerminationClass::Truncation,
        &["truncated", "max_steps", "step_limit", "limit"],
    ),
    (
        TerminationClass::EnvDone,
        &["success", "env_done", "solved", "correct"],
    ),
];

/// Classifies a free-text termination reason.
///
/// "env_done" contains "done", so it lands in [`TerminationClass::Finish`];
/// only the other env-done synonyms reach [`TerminationClass::EnvDone`].
pub fn classify_termination(reason: &str) -> TerminationClass {
    let reason = reason.to_lowercase();
    TERMINATION_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| reason.contains(k)))
        .map(|(class, _)| *class)
        .unwrap_or(TerminationClass::Unknown)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TerminationCategories {
    pub env_done: CountRatio,
    pub truncation: CountRatio,
    pub timeout: CountRatio,
    pub finish: CountRatio,
    pub unknown: CountRatio,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TerminationStats {
    pub total: usize,
    pub categories: TerminationCategories,
    /// truncation + timeout + unknown.
    pub unexpected: CountRatio,
}

pub fn termination_stats(trajectories: &[Trajectory]) -> TerminationStats {
    let (mut finish, mut timeout, mut truncation, mut env_done, mut unknown) = (0, 0, 0, 0, 0);
    for t in trajectories {
        match classify_termination(&t.termination_reason) {
            TerminationClass::Finish => finish += 1,
            TerminationClass::Timeout => timeout += 1,
            TerminationClass::Truncation => truncation += 1,
            TerminationClass::EnvDone => env_done += 1,
            TerminationClass::Unknown => unknown += 1,
        }
    }

    let total = trajectories.len();
    TerminationStats {
        total,
        categories: TerminationCategories {
            env_done: CountRatio::of(env_done, total),
            truncation: CountRatio::of(truncation, total),
            timeout: CountRatio::of(timeout, total),
            finish: CountRatio::of(finish, total),
            unknown: CountRatio::of(unknown, total),
        },
        unexpected: CountRatio::of(truncation + timeout + unknown, total),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolReturnClass {
    Normal,
    Empty,
    Timeout,
    ConnectionError,
}

impl ToolReturnClass {
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, ToolReturnClass::Normal)
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "normal" => Some(ToolReturnClass::Normal),
            "empty" => Some(ToolReturnClass::Empty),
            "timeout" => Some(ToolReturnClass::Timeout),
            "connection_error" => Some(ToolReturnClass::ConnectionError),
            _ => None,
        }
    }
}

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "time out"];
const CONNECTION_KEYWORDS: &[&str] = &[
    "connection",
    "network error",
    "connect failed",
    "connection refused",
];

/// Classifies a step observation: blank, then timeout, then connection error.
pub fn classify_tool_return(observation: Option<&str>) -> ToolReturnClass {
    let observation = match observation.map(str::trim) {
        Some(o) if !o.is_empty() => o.to_lowercase(),
        _ => return ToolReturnClass::Empty,
    };
    if TIMEOUT_KEYWORDS.iter().any(|k| observation.contains(k)) {
        ToolReturnClass::Timeout
    } else if CONNECTION_KEYWORDS.iter().any(|k| observation.contains(k)) {
        ToolReturnClass::ConnectionError
    } else {
        ToolReturnClass::Normal
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ToolReturnCategories {
    pub normal: CountRatio,
    pub empty: CountRatio,
    pub timeout: CountRatio,
    pub connection_error: CountRatio,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ToolReturnStats {
    /// Every step counts as one tool call.
    pub total_tool_calls: usize,
    pub categories: ToolReturnCategories,
    /// empty + timeout + connection_error.
    pub unexpected: CountRatio,
}

pub fn tool_return_stats(trajectories: &[Trajectory]) -> ToolReturnStats {
    let (mut normal, mut empty, mut timeout, mut connection) = (0, 0, 0, 0);
    for step in trajectories.iter().flat_map(|t| &t.steps) {
        match classify_tool_return(step.observation.as_deref()) {
            ToolReturnClass::Normal => normal += 1,
            ToolReturnClass::Empty => empty += 1,
            ToolReturnClass::Timeout => timeout += 1,
            ToolReturnClass::ConnectionError => connection += 1,
        }
    }

    let total = normal + empty + timeout + connection;
    ToolReturnStats {
        total_tool_calls: total,
        categories: ToolReturnCategories {
            normal: CountRatio::of(normal, total),
            empty: CountRatio::of(empty, total),
            timeout: CountRatio::of(timeout, total),
            connection_error: CountRatio::of(connection, total),
        },
        unexpected: CountRatio::of(empty + timeout + connection, total),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolContextDetail {
    /// First 100 characters of the question.
    pub question: String,
    pub step_number: i64,
}

/// A step whose tool call came back empty, timed out or failed to connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolContext {
    pub trajectory_id: String,
    pub step_id: i64,
    pub action: String,
    pub observation: String,
    pub category: ToolReturnClass,
    pub context: ToolContextDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnexpectedToolContexts {
    pub total: usize,
    pub data: Vec<ToolContext>,
}

/// Up to `limit` unexpected tool returns, optionally of one class only.
pub fn unexpected_tool_contexts(
    trajectories: &[Trajectory],
    category: Option<ToolReturnClass>,
    limit: usize,
) -> UnexpectedToolContexts {
    let data: Vec<ToolContext> = trajectories
        .iter()
        .flat_map(|t| t.steps.iter().map(move |step| (t, step)))
        .filter_map(|(t, step)| {
            let class = classify_tool_return(step.observation.as_deref());
            if !class.is_unexpected() || category.is_some_and(|c| c != class) {
                return None;
            }
            Some(ToolContext {
                trajectory_id: t.trajectory_id.clone(),
                step_id: step.step_id,
                action: step.action.clone().unwrap_or_default(),
                observation: step.observation.clone().unwrap_or_default(),
                category: class,
                context: ToolContextDetail {
                    question: preview(t.question(), QUESTION_PREVIEW_CHARS),
                    step_number: step.step_id,
                },
            })
        })
        .take(limit)
        .collect();

    UnexpectedToolContexts {
        total: data.len(),
        data,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RewardCategories {
    pub perfect_score: CountRatio,
    pub complete_failure: CountRatio,
    pub partial_success: CountRatio,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RewardStats {
    pub total: usize,
    pub max_reward: f64,
    pub min_reward: f64,
    pub avg_reward: f64,
    pub categories: RewardCategories,
}

/// Reward range and buckets: perfect (>= 1), failure (<= 0), partial otherwise.
pub fn reward_stats(trajectories: &[Trajectory]) -> RewardStats {
    if trajectories.is_empty() {
        return RewardStats::default();
    }

    let total = trajectories.len();
    let rewards = || trajectories.iter().map(|t| t.reward);
    let perfect = rewards().filter(|r| *r >= 1.0).count();
    let failure = rewards().filter(|r| *r <= 0.0).count();

    RewardStats {
        total,
        max_reward: round_to(rewards().fold(f64::NEG_INFINITY, f64::max), 3),
        min_reward: round_to(rewards().fold(f64::INFINITY, f64::min), 3),
        avg_reward: round_to(mean(rewards()), 3),
        categories: RewardCategories {
            perfect_score: CountRatio::of(perfect, total),
            complete_failure: CountRatio::of(failure, total),
            partial_success: CountRatio::of(total - perfect - failure, total),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::Step;

    fn ended(reason: &str) -> Trajectory {
        let mut t = Trajectory::new(reason, "q");
        t.termination_reason = reason.to_string();
        t
    }

    fn step(id: i64, observation: Option<&str>) -> Step {
        Step {
            step_id: id,
            action: Some(format!("call_{}", id)),
            observation: observation.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_termination_order() {
        assert_eq!(classify_termination("Finished"), TerminationClass::Finish);
        assert_eq!(classify_termination("env_done"), TerminationClass::Finish);
        assert_eq!(classify_termination("TIMEOUT"), TerminationClass::Timeout);
        assert_eq!(classify_termination("max_steps"), TerminationClass::Truncation);
        assert_eq!(classify_termination("solved"), TerminationClass::EnvDone);
        assert_eq!(classify_termination(""), TerminationClass::Unknown);
        assert_eq!(classify_termination("crashed"), TerminationClass::Unknown);
        // finish beats timeout when both appear
        assert_eq!(classify_termination("done after timeout"), TerminationClass::Finish);
    }

    #[test]
    fn test_termination_stats() {
        let stats = termination_stats(&[
            ended("finish"),
            ended("timeout"),
            ended("step_limit"),
            ended("weird"),
        ]);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.categories.finish.count, 1);
        assert_eq!(stats.unexpected.count, 3);
        assert_eq!(stats.unexpected.ratio, 0.75);

        let empty = termination_stats(&[]);
        assert_eq!(empty.unexpected.ratio, 0.0);
    }

    #[test]
    fn test_tool_return_classes() {
        assert_eq!(classify_tool_return(None), ToolReturnClass::Empty);
        assert_eq!(classify_tool_return(Some("   ")), ToolReturnClass::Empty);
        assert_eq!(classify_tool_return(Some("Request Timed Out")), ToolReturnClass::Timeout);
        assert_eq!(
            classify_tool_return(Some("Connection refused")),
            ToolReturnClass::ConnectionError
        );
        assert_eq!(classify_tool_return(Some("42")), ToolReturnClass::Normal);
    }

    #[test]
    fn test_tool_return_stats_and_contexts() {
        let mut t = Trajectory::new("t1", "q").with_steps(vec![
            step(1, Some("ok")),
            step(2, None),
            step(3, Some("timeout after 30s")),
            step(4, Some("connect failed")),
        ]);
        t.task.question = "x".repeat(150);
        let trajectories = vec![t];

        let stats = tool_return_stats(&trajectories);
        assert_eq!(stats.total_tool_calls, 4);
        assert_eq!(stats.unexpected.count, 3);
        assert_eq!(stats.unexpected.ratio, 0.75);

        let all = unexpected_tool_contexts(&trajectories, None, 50);
        assert_eq!(all.total, 3);
        assert_eq!(all.data[0].step_id, 2);
        assert_eq!(all.data[0].context.question.chars().count(), 103);
        assert!(all.data[0].context.question.ends_with("..."));

        let only_timeout =
            unexpected_tool_contexts(&trajectories, Some(ToolReturnClass::Timeout), 50);
        assert_eq!(only_timeout.total, 1);
        assert_eq!(only_timeout.data[0].action, "call_3");

        assert_eq!(unexpected_tool_contexts(&trajectories, None, 2).total, 2);
        assert_eq!(
            unexpected_tool_contexts(&trajectories, Some(ToolReturnClass::Normal), 50).total,
            0
        );
    }

    #[test]
    fn test_reward_stats() {
        let trajectories: Vec<Trajectory> = [1.0, 1.2, 0.0, -0.5, 0.4]
            .iter()
            .enumerate()
            .map(|(i, r)| Trajectory::new(i.to_string(), "q").with_reward(*r))
            .collect();
        let stats = reward_stats(&trajectories);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.max_reward, 1.2);
        assert_eq!(stats.min_reward, -0.5);
        assert_eq!(stats.avg_reward, 0.42);
        assert_eq!(stats.categories.perfect_score.count, 2);
        assert_eq!(stats.categories.complete_failure.count, 2);
        assert_eq!(stats.categories.partial_success.count, 1);
        assert_eq!(stats.categories.partial_success.ratio, 0.2);

        assert_eq!(reward_stats(&[]), RewardStats::default());
    }
}
