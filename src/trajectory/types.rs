//! Trajectory data types for recorded agent executions.
//!
//! A trajectory is one attempt of an agent at a question (`data_id`), carrying
//! the conversational transcript, per-step reward records and the training
//! coordinates that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Any role label the upstream framework emits that we do not model.
    #[serde(other)]
    Other,
}

impl Role {
    /// Parses a role label, mapping unrecognised labels to [`Role::Other`].
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" | "function" => Role::Tool,
            _ => Role::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Other => "other",
        }
    }
}

/// A single role-tagged message of a trajectory transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// The question a trajectory attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub ground_truth: String,
}

/// One per-step record of a trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position of the step as reported by the agent framework.
    #[serde(default)]
    pub step_id: i64,

    #[serde(default)]
    pub thought: String,

    #[serde(default)]
    pub model_response: String,

    /// Tool call issued in this step, if any.
    #[serde(default)]
    pub action: Option<String>,

    /// Raw tool return observed after the action.
    #[serde(default)]
    pub observation: Option<String>,

    /// Process reward assigned to this step.
    #[serde(default)]
    pub reward: f64,

    #[serde(default)]
    pub done: bool,

    /// Monte-Carlo return from this step onward.
    #[serde(default)]
    pub mc_return: f64,

    #[serde(default)]
    pub info: serde_json::Value,
}

/// A recorded execution attempt of an agent against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Globally unique id: `{data_id}-{training_id}-{epoch}-{iteration}-{sample}-{tree}`.
    pub trajectory_id: String,

    /// Groups all attempts at the same underlying question.
    pub data_id: String,

    pub task: Task,

    /// Ordered role-tagged transcript.
    #[serde(default)]
    pub chat_completions: Vec<Message>,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Final (outcome) reward.
    pub reward: f64,
    #[serde(default)]
    pub toolcall_reward: f64,
    #[serde(default)]
    pub res_reward: f64,

    /// Wall-clock execution time in seconds.
    #[serde(default)]
    pub exec_time: f64,

    #[serde(default)]
    pub training_id: String,
    #[serde(default)]
    pub epoch_id: i64,
    #[serde(default)]
    pub iteration_id: i64,
    #[serde(default)]
    pub sample_id: i64,
    #[serde(default)]
    pub tree_id: Option<String>,

    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub termination_reason: String,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub is_bookmarked: bool,

    /// Where the record came from (`json_import`, `jsonl_import`, `dict_import`).
    #[serde(default)]
    pub source: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trajectory {
    /// Creates a trajectory with the two required identifiers and defaults elsewhere.
    pub fn new(trajectory_id: impl Into<String>, data_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            trajectory_id: trajectory_id.into(),
            data_id: data_id.into(),
            task: Task::default(),
            chat_completions: Vec::new(),
            steps: Vec::new(),
            reward: 0.0,
            toolcall_reward: 0.0,
            res_reward: 0.0,
            exec_time: 0.0,
            training_id: String::new(),
            epoch_id: 0,
            iteration_id: 0,
            sample_id: 0,
            tree_id: None,
            agent_name: String::new(),
            termination_reason: String::new(),
            tags: Vec::new(),
            notes: String::new(),
            is_bookmarked: false,
            source: String::from("api"),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = reward;
        self
    }

    pub fn with_transcript(mut self, messages: Vec<Message>) -> Self {
        self.chat_completions = messages;
        self
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn question(&self) -> &str {
        &self.task.question
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Mean of the per-step process rewards, `None` when there are no steps.
    pub fn mean_step_reward(&self) -> Option<f64> {
        if self.steps.is_empty() {
            return None;
        }
        let sum: f64 = self.steps.iter().map(|s| s.reward).sum();
        Some(sum / self.steps.len() as f64)
    }
}

/// Outcome of classifying one trajectory. At most one live record exists per
/// trajectory; re-analysis replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub trajectory_id: String,
    pub is_success: bool,
    pub category: String,
    pub root_cause: String,
    pub suggestion: String,
    pub analyzed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("assistant"), Role::Assistant);
        assert_eq!(Role::parse(" User "), Role::User);
        assert_eq!(Role::parse("function"), Role::Tool);
        assert_eq!(Role::parse("narrator"), Role::Other);
    }

    #[test]
    fn test_role_deserialize_unknown() {
        let msg: Message =
            serde_json::from_str(r#"{"role":"observer","content":"x"}"#).expect("valid message");
        assert_eq!(msg.role, Role::Other);
    }

    #[test]
    fn test_mean_step_reward() {
        let traj = Trajectory::new("t", "d");
        assert!(traj.mean_step_reward().is_none());

        let traj = traj.with_steps(vec![
            Step {
                reward: 0.2,
                ..Default::default()
            },
            Step {
                reward: 0.4,
                ..Default::default()
            },
        ]);
        let mean = traj.mean_step_reward().expect("has steps");
        assert!((mean - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_trajectory_serialization() {
        let traj = Trajectory::new("a-b-0-0-0-1", "a")
            .with_reward(1.0)
            .with_transcript(vec![Message::user("hi"), Message::assistant("hello")]);
        let json = serde_json::to_string(&traj).expect("serialization should work");
        assert!(json.contains("\"role\":\"assistant\""));

        let back: Trajectory = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(back.trajectory_id, "a-b-0-0-0-1");
        assert_eq!(back.chat_completions.len(), 2);
    }
}
