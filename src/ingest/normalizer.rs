//! Mapping of loosely shaped records onto [`Trajectory`].
//!
//! Agent frameworks emit three record shapes:
//! - a batch wrapper `{"trajectories": [...]}`
//! - a nested wrapper `{"trajectory": {...}, "metrics": {...}, "chat_completions": [...]}`
//! - a flat trajectory object
//!
//! Every shape is reduced to a flat map, repaired and coerced field by field.
//! Problems never abort: each candidate carries either a trajectory or the
//! list of reasons it was rejected.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::trajectory::{Message, Role, Step, Task, Trajectory};

/// Minimum number of dash segments of a composite trajectory id.
const COMPOSITE_ID_SEGMENTS: usize = 6;

/// One trajectory candidate produced from a decoded record.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Position inside a batch wrapper; 0 for single records.
    pub position: usize,
    /// The raw id, when one could be read, for error messages.
    pub trajectory_id: Option<String>,
    pub outcome: Result<Trajectory, Vec<String>>,
}

impl Candidate {
    fn rejected(position: usize, trajectory_id: Option<String>, errors: Vec<String>) -> Self {
        Self {
            position,
            trajectory_id,
            outcome: Err(errors),
        }
    }
}

/// Normalizes decoded records, stamping each trajectory with a source label.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    source: String,
}

impl RecordNormalizer {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Produces zero or more candidates from one decoded value.
    pub fn normalize(&self, value: &Value) -> Vec<Candidate> {
        let Some(obj) = value.as_object() else {
            return vec![Candidate::rejected(
                0,
                None,
                vec![format!("record must be a JSON object, got {}", type_name(value))],
            )];
        };

        if let Some(Value::Array(items)) = obj.get("trajectories") {
            return items
                .iter()
                .enumerate()
                .map(|(position, item)| match item.as_object() {
                    Some(inner) => {
                        let mut candidate = self.normalize_single(inner);
                        candidate.position = position;
                        candidate
                    }
                    None => Candidate::rejected(
                        position,
                        None,
                        vec![format!(
                            "trajectories[{}] must be an object, got {}",
                            position,
                            type_name(item)
                        )],
                    ),
                })
                .collect();
        }

        vec![self.normalize_single(obj)]
    }

    fn normalize_single(&self, obj: &Map<String, Value>) -> Candidate {
        match obj.get("trajectory") {
            Some(Value::Object(inner)) => self.normalize_flat(&flatten_nested(obj, inner)),
            _ => self.normalize_flat(obj),
        }
    }

    fn normalize_flat(&self, obj: &Map<String, Value>) -> Candidate {
        let raw_id = obj.get("trajectory_id").and_then(id_string);
        let errors = validate(obj);
        if !errors.is_empty() {
            return Candidate::rejected(0, raw_id, errors);
        }

        // validate() guarantees both ids
        let trajectory_id = raw_id.unwrap_or_default();
        let data_id = obj.get("data_id").and_then(id_string).unwrap_or_default();

        let chat_completions: Vec<Message> = obj
            .get("chat_completions")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(message_from_value).collect())
            .unwrap_or_default();

        let steps: Vec<Step> = obj
            .get("steps")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(step_from_value).collect())
            .unwrap_or_default();

        let training_id = text_field(obj, "training_id");
        let epoch_id = int_field(obj, "epoch_id");
        let iteration_id = int_field(obj, "iteration_id");
        let sample_id = int_field(obj, "sample_id");
        let tree_id = obj.get("tree_id").and_then(id_string);

        let trajectory_id = repair_trajectory_id(
            trajectory_id,
            &data_id,
            &training_id,
            epoch_id,
            iteration_id,
            sample_id,
            tree_id.as_deref(),
        );

        let task = resolve_task(obj.get("task"), &chat_completions);
        let res_reward = float_field(obj, "res_reward");
        let reward = resolve_reward(obj, res_reward);

        let now = Utc::now();
        let trajectory = Trajectory {
            trajectory_id: trajectory_id.clone(),
            data_id,
            task,
            chat_completions,
            steps,
            reward,
            toolcall_reward: float_field(obj, "toolcall_reward"),
            res_reward,
            exec_time: float_field(obj, "exec_time"),
            training_id,
            epoch_id,
            iteration_id,
            sample_id,
            tree_id,
            agent_name: text_field(obj, "agent_name"),
            termination_reason: text_field(obj, "termination_reason"),
            tags: obj
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| tags.iter().filter_map(scalar_string).collect())
                .unwrap_or_default(),
            notes: text_field(obj, "notes"),
            is_bookmarked: obj.get("is_bookmarked").map(lenient_bool).unwrap_or(false),
            source: self.source.clone(),
            created_at: now,
            updated_at: now,
        };

        Candidate {
            position: 0,
            trajectory_id: Some(trajectory_id),
            outcome: Ok(trajectory),
        }
    }
}

/// Checks the fields a record cannot be stored without.
pub fn validate(obj: &Map<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();

    for field in ["trajectory_id", "data_id"] {
        match obj.get(field) {
            None | Some(Value::Null) => errors.push(format!("Missing required field: {}", field)),
            Some(v) if id_string(v).is_none() => {
                errors.push(format!("{} must be a non-empty string or number", field))
            }
            _ => {}
        }
    }

    for field in ["steps", "chat_completions"] {
        if let Some(v) = obj.get(field) {
            if !v.is_array() && !v.is_null() {
                errors.push(format!("{} must be a list", field));
            }
        }
    }

    errors
}

/// Merges a nested wrapper into one flat map: identity and task from
/// `trajectory`, rewards from `metrics`, transcript from the sibling
/// `chat_completions`.
fn flatten_nested(outer: &Map<String, Value>, inner: &Map<String, Value>) -> Map<String, Value> {
    let mut flat = inner.clone();

    if let Some(Value::Object(metrics)) = outer.get("metrics") {
        for key in ["reward", "toolcall_reward", "res_reward"] {
            if let Some(v) = metrics.get(key) {
                flat.insert(key.to_string(), v.clone());
            }
        }
        if let Some(v) = metrics.get("total_time") {
            flat.insert("exec_time".to_string(), v.clone());
        }
    }

    if let Some(v) = outer.get("chat_completions") {
        flat.insert("chat_completions".to_string(), v.clone());
    }

    for key in ["final_reward", "trajectory_reward"] {
        let candidate = outer.get(key).or_else(|| {
            outer
                .get("metrics")
                .and_then(Value::as_object)
                .and_then(|m| m.get(key))
        });
        if let Some(v) = candidate {
            flat.insert(key.to_string(), v.clone());
        }
    }

    flat
}

/// Rebuilds the composite id when it does not already end in `tree_id`.
pub fn repair_trajectory_id(
    trajectory_id: String,
    data_id: &str,
    training_id: &str,
    epoch_id: i64,
    iteration_id: i64,
    sample_id: i64,
    tree_id: Option<&str>,
) -> String {
    let Some(tree_id) = tree_id else {
        return trajectory_id;
    };

    let segments: Vec<&str> = trajectory_id.split('-').collect();
    if segments.len() >= COMPOSITE_ID_SEGMENTS && segments.last() == Some(&tree_id) {
        return trajectory_id;
    }

    let repaired = format!(
        "{}-{}-{}-{}-{}-{}",
        data_id, training_id, epoch_id, iteration_id, sample_id, tree_id
    );
    tracing::debug!(original = %trajectory_id, repaired = %repaired, "Repaired trajectory id");
    repaired
}

fn resolve_task(task: Option<&Value>, transcript: &[Message]) -> Task {
    match task {
        Some(Value::Object(t)) => Task {
            question: t.get("question").and_then(scalar_string).unwrap_or_default(),
            ground_truth: t
                .get("ground_truth")
                .and_then(scalar_string)
                .unwrap_or_default(),
        },
        Some(Value::String(question)) => Task {
            question: question.clone(),
            ground_truth: String::new(),
        },
        _ => {
            // The prompt sits after the system message.
            let question = transcript
                .get(1)
                .filter(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Task {
                question,
                ground_truth: String::new(),
            }
        }
    }
}

/// Final reward: a nonzero explicit override wins, then `res_reward` stands in
/// for a zero reward.
fn resolve_reward(obj: &Map<String, Value>, res_reward: f64) -> f64 {
    let explicit = ["final_reward", "trajectory_reward"]
        .iter()
        .filter_map(|key| obj.get(*key).and_then(lenient_f64))
        .find(|v| *v != 0.0);
    if let Some(v) = explicit {
        return v;
    }

    let reward = obj.get("reward").and_then(lenient_f64).unwrap_or(0.0);
    if reward == 0.0 && res_reward != 0.0 {
        res_reward
    } else {
        reward
    }
}

fn message_from_value(value: &Value) -> Message {
    match value.as_object() {
        Some(m) => Message::new(
            m.get("role")
                .and_then(Value::as_str)
                .map(Role::parse)
                .unwrap_or(Role::Other),
            m.get("content").map(content_text).unwrap_or_default(),
        ),
        None => Message::new(Role::Other, content_text(value)),
    }
}

/// Flattens message content; multi-part content keeps its text parts.
fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                Value::Object(p) => p
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| part.to_string()),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn step_from_value(value: &Value) -> Step {
    let Some(s) = value.as_object() else {
        return Step {
            info: value.clone(),
            ..Default::default()
        };
    };

    Step {
        step_id: s.get("step_id").and_then(lenient_i64).unwrap_or(0),
        thought: s.get("thought").map(content_text).unwrap_or_default(),
        model_response: s.get("model_response").map(content_text).unwrap_or_default(),
        action: s.get("action").filter(|v| !v.is_null()).map(content_text),
        observation: s.get("observation").filter(|v| !v.is_null()).map(content_text),
        reward: s.get("reward").and_then(lenient_f64).unwrap_or(0.0),
        done: s.get("done").map(lenient_bool).unwrap_or(false),
        mc_return: s.get("mc_return").and_then(lenient_f64).unwrap_or(0.0),
        info: s.get("info").cloned().unwrap_or(Value::Null),
    }
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key).and_then(scalar_string).unwrap_or_default()
}

fn float_field(obj: &Map<String, Value>, key: &str) -> f64 {
    obj.get(key).and_then(lenient_f64).unwrap_or(0.0)
}

fn int_field(obj: &Map<String, Value>, key: &str) -> i64 {
    obj.get(key).and_then(lenient_i64).unwrap_or(0)
}

/// Non-empty string or number rendered as text.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

fn lenient_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
