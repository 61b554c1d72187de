//! Rule-based failure classification of trajectory transcripts.
//!
//! Rules are evaluated in a fixed order and the first one that fires decides
//! the diagnosis; later rules are never evaluated. Structural problems come
//! first because they invalidate any reading of the content, followed by the
//! cheap loop and length checks, with the most specific semantic check last.
//!
//! | Priority | Rule | Category | Root cause |
//! |---|---|---|---|
//! | 10 | format anomaly | `1. Trajectory Anomaly (Format)` | mismatched tags / invalid format |
//! | 20 | repeated tool failure | `1. Trajectory Anomaly (Loop)` | `3.2` |
//! | 30 | repeater | `1. Trajectory Anomaly (Loop)` | `3.1` |
//! | 40 | turn limit | `1. Trajectory Anomaly (Length)` | `3.3` |
//! | 45 | hanging | `1. Trajectory Anomaly (Truncated)` | `4.3` |
//! | 50 | overconfidence | `2. Trajectory Error (Logic)` | `7.1` |
//!
//! When nothing fires the result is `4. Model Capability Issue` / `4.0`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::trajectory::{Message, Role};

/// Literal tokens the upstream agent framework uses to delimit thoughts,
/// tool calls and finish calls in transcripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSet {
    /// Any of these in an assistant message signals tool-call intent.
    pub tool_intent: Vec<String>,
    pub tool_open: String,
    pub tool_close: String,
    /// A well-formed tool call matches this pattern.
    pub structural_pattern: String,
    /// Present in an assistant message that issued an action.
    pub action: String,
    /// Present in a final message that successfully finished.
    pub finish_signal: String,
    /// Present in an assistant message calling the finish tool.
    pub finish_call: String,
    pub finish_keyword: String,
    /// Phrases admitting the answer was not verified (lowercase).
    pub hedges: Vec<String>,
    /// Phrases in tool/user messages reporting a failed tool call (lowercase).
    pub tool_error_phrases: Vec<String>,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            tool_intent: vec![
                "<ctrl3605>".to_string(),
                "</ctrl3613>".to_string(),
                "[tool]".to_string(),
                "<function>".to_string(),
            ],
            tool_open: "<ctrl3614>".to_string(),
            tool_close: "</ctrl3615>".to_string(),
            structural_pattern: r"(?s)<\w+>.*?</\w+>".to_string(),
            action: "<ctrl3617>".to_string(),
            finish_signal: "<ctrl3616>".to_string(),
            finish_call: "<ctrl3618>".to_string(),
            finish_keyword: "finish".to_string(),
            hedges: vec![
                "假设".to_string(),
                "无法验证".to_string(),
                "assume".to_string(),
                "cannot verify".to_string(),
            ],
            tool_error_phrases: vec![
                "tool call parsing failed".to_string(),
                "execution failed".to_string(),
                "error:".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Turn limit the agent ran under; transcripts longer than twice this are flagged.
    pub max_turn_limit: usize,
    /// Context size the agent ran under, reported alongside diagnoses.
    pub context_char_limit: usize,
    /// Tool errors tolerated before the loop rule fires.
    pub max_tool_errors: usize,
    /// Trailing assistant messages compared by the repeater rule.
    pub repeat_window: usize,
    pub markers: MarkerSet,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_turn_limit: 8,
            context_char_limit: 32_000,
            max_tool_errors: 2,
            repeat_window: 3,
            markers: MarkerSet::default(),
        }
    }
}

/// Numeric facts about a trajectory passed alongside its transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NumericContext {
    pub reward: f64,
    pub exec_time: f64,
    pub step_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    FormatAnomaly,
    LoopAnomaly,
    LengthAnomaly,
    TruncatedAnomaly,
    LogicError,
    ModelCapability,
}

impl FailureCategory {
    pub fn label(&self) -> &'static str {
        match self {
            FailureCategory::FormatAnomaly => "1. Trajectory Anomaly (Format)",
            FailureCategory::LoopAnomaly => "1. Trajectory Anomaly (Loop)",
            FailureCategory::LengthAnomaly => "1. Trajectory Anomaly (Length)",
            FailureCategory::TruncatedAnomaly => "1. Trajectory Anomaly (Truncated)",
            FailureCategory::LogicError => "2. Trajectory Error (Logic)",
            FailureCategory::ModelCapability => "4. Model Capability Issue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    MismatchedToolTags,
    InvalidToolFormat,
    RepeatedToolFailures,
    RepetitiveOutput,
    TurnLimitExceeded,
    NoActionAfterThought,
    Overconfidence,
    Unknown,
}

impl RootCause {
    pub fn label(&self) -> &'static str {
        match self {
            RootCause::MismatchedToolTags => "1.1 Mismatched Tool Tags",
            RootCause::InvalidToolFormat => "1.3 Invalid Tool Format",
            RootCause::RepeatedToolFailures => {
                "3.2 Lengthy due to Repeated Tool Failures (> 2 errors)"
            }
            RootCause::RepetitiveOutput => "3.1 Repetitive Output / Repeater",
            RootCause::TurnLimitExceeded => "3.3 Turn Limit Exceeded",
            RootCause::NoActionAfterThought => {
                "4.3 No Action after Thought / Abnormal Stop (Possible Truncation)"
            }
            RootCause::Overconfidence => "7.1 Model Overconfidence / False Positive Finish",
            RootCause::Unknown => "4.0 Unknown Error / General Response Error",
        }
    }
}

/// The rule chain, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    FormatAnomaly,
    RepeatedToolFailure,
    Repeater,
    TurnLimit,
    Hanging,
    Overconfidence,
}

impl Rule {
    pub const ORDERED: [Rule; 6] = [
        Rule::FormatAnomaly,
        Rule::RepeatedToolFailure,
        Rule::Repeater,
        Rule::TurnLimit,
        Rule::Hanging,
        Rule::Overconfidence,
    ];

    pub fn priority(&self) -> u32 {
        match self {
            Rule::FormatAnomaly => 10,
            Rule::RepeatedToolFailure => 20,
            Rule::Repeater => 30,
            Rule::TurnLimit => 40,
            Rule::Hanging => 45,
            Rule::Overconfidence => 50,
        }
    }
}

/// Category and root cause of one trajectory, plus the rule that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: FailureCategory,
    pub root_cause: RootCause,
    /// `None` when no rule fired.
    pub rule: Option<Rule>,
}

impl Diagnosis {
    pub fn fallback() -> Self {
        Self {
            category: FailureCategory::ModelCapability,
            root_cause: RootCause::Unknown,
            rule: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    config: ClassifierConfig,
    structural: Regex,
}

impl FailureClassifier {
    /// Fails only when the configured structural pattern is not a valid regex.
    pub fn new(config: ClassifierConfig) -> Result<Self, regex::Error> {
        let structural = Regex::new(&config.markers.structural_pattern)?;
        Ok(Self { config, structural })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Runs the rule chain, stopping at the first rule that fires.
    pub fn classify(&self, transcript: &[Message], context: &NumericContext) -> Diagnosis {
        for rule in Rule::ORDERED {
            if let Some((category, root_cause)) = self.evaluate(rule, transcript, context) {
                return Diagnosis {
                    category,
                    root_cause,
                    rule: Some(rule),
                };
            }
        }
        Diagnosis::fallback()
    }

    fn evaluate(
        &self,
        rule: Rule,
        transcript: &[Message],
        _context: &NumericContext,
    ) -> Option<(FailureCategory, RootCause)> {
        match rule {
            Rule::FormatAnomaly => self.check_format(transcript),
            Rule::RepeatedToolFailure => self.check_repeated_tool_failure(transcript),
            Rule::Repeater => self.check_repeater(transcript),
            Rule::TurnLimit => self.check_turn_limit(transcript),
            Rule::Hanging => self.check_hanging(transcript),
            Rule::Overconfidence => self.check_overconfidence(transcript),
        }
    }

    fn check_format(&self, transcript: &[Message]) -> Option<(FailureCategory, RootCause)> {
        let m = &self.config.markers;
        for msg in transcript.iter().filter(|msg| msg.role == Role::Assistant) {
            let content = &msg.content;
            let has_intent = m.tool_intent.iter().any(|k| content.contains(k.as_str()));
            if !has_intent || self.structural.is_match(content) {
                continue;
            }

            let opens = content.matches(m.tool_open.as_str()).count();
            let closes = content.matches(m.tool_close.as_str()).count();
            let cause = if opens != closes {
                RootCause::MismatchedToolTags
            } else {
                RootCause::InvalidToolFormat
            };
            return Some((FailureCategory::FormatAnomaly, cause));
        }
        None
    }

    fn check_repeated_tool_failure(
        &self,
        transcript: &[Message],
    ) -> Option<(FailureCategory, RootCause)> {
        let last = transcript.last()?;
        let m = &self.config.markers;

        let errors = transcript
            .iter()
            .filter(|msg| matches!(msg.role, Role::Tool | Role::User))
            .filter(|msg| {
                let content = msg.content.trim().to_lowercase();
                m.tool_error_phrases
                    .iter()
                    .any(|p| content.contains(p.as_str()))
            })
            .count();

        let last_content = last.content.to_lowercase();
        let finished = last_content.contains(m.finish_keyword.as_str())
            && last_content.contains(m.finish_signal.as_str());

        (errors > self.config.max_tool_errors && !finished)
            .then_some((FailureCategory::LoopAnomaly, RootCause::RepeatedToolFailures))
    }

    fn check_repeater(&self, transcript: &[Message]) -> Option<(FailureCategory, RootCause)> {
        let window = self.config.repeat_window.max(2);
        let assistant: Vec<&str> = transcript
            .iter()
            .filter(|msg| msg.role == Role::Assistant)
            .map(|msg| msg.content.as_str())
            .collect();
        if assistant.len() < window {
            return None;
        }

        let tail = &assistant[assistant.len() - window..];
        tail.iter()
            .all(|c| *c == tail[0])
            .then_some((FailureCategory::LoopAnomaly, RootCause::RepetitiveOutput))
    }

    fn check_turn_limit(&self, transcript: &[Message]) -> Option<(FailureCategory, RootCause)> {
        (transcript.len() > self.config.max_turn_limit * 2)
            .then_some((FailureCategory::LengthAnomaly, RootCause::TurnLimitExceeded))
    }

    fn check_hanging(&self, transcript: &[Message]) -> Option<(FailureCategory, RootCause)> {
        let last = transcript.last().filter(|msg| msg.role == Role::Assistant)?;
        (!last.content.contains(self.config.markers.action.as_str()))
            .then_some((FailureCategory::TruncatedAnomaly, RootCause::NoActionAfterThought))
    }

    fn check_overconfidence(&self, transcript: &[Message]) -> Option<(FailureCategory, RootCause)> {
        let last = transcript.last().filter(|msg| msg.role == Role::Assistant)?;
        let m = &self.config.markers;
        let content = last.content.to_lowercase();

        let finish_call = content.contains(m.finish_call.as_str())
            && content.contains(m.finish_keyword.as_str());
        let hedged = m.hedges.iter().any(|h| content.contains(h.as_str()));

        (finish_call && hedged)
            .then_some((FailureCategory::LogicError, RootCause::Overconfidence))
    }
}
