//! Remediation text for a diagnosis.
//!
//! Works on labels rather than the typed enums so stored results and
//! `Analysis Error` placeholders map the same way.

/// Category reported when classifying a trajectory failed outright.
pub const ANALYSIS_ERROR_CATEGORY: &str = "Analysis Error";

const CATEGORY_SUGGESTIONS: &[(&str, &str)] = &[
    (
        "Format",
        "Check the tool call format and make sure every opening tag has a matching closing tag",
    ),
    ("Loop", "Add a retry limit or loop detection to the agent"),
    ("Truncated", "Add a context length check before generating"),
    (
        "Logic",
        "Improve the reasoning chain and verify the answer before calling finish",
    ),
    (
        "Model Capability",
        "Provide more examples or a clearer prompt for this task type",
    ),
];

const ROOT_CAUSE_SUGGESTIONS: &[(&str, &str)] = &[
    (
        "repeated",
        "Repeated errors detected; add error handling and a retry mechanism",
    ),
    ("format", "Check and fix the tool call format"),
    ("limit", "Optimize context usage or raise the length limit"),
];

const DEFAULT_SUGGESTION: &str = "Review the full trajectory log for more detail";

/// Maps a `(category, root_cause)` pair to a suggestion.
///
/// The category decides first; the root cause is only consulted when the
/// category has no mapping.
pub fn suggest(category: &str, root_cause: &str) -> &'static str {
    if category == ANALYSIS_ERROR_CATEGORY {
        return "Analysis itself failed; check that the trajectory record is complete";
    }

    if let Some((_, text)) = CATEGORY_SUGGESTIONS
        .iter()
        .find(|(key, _)| category.contains(key))
    {
        return text;
    }

    let cause = root_cause.to_lowercase();
    ROOT_CAUSE_SUGGESTIONS
        .iter()
        .find(|(key, _)| cause.contains(key))
        .map(|(_, text)| *text)
        .unwrap_or(DEFAULT_SUGGESTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::{FailureCategory, RootCause};

    #[test]
    fn test_every_category_has_a_specific_suggestion() {
        for category in [
            FailureCategory::FormatAnomaly,
            FailureCategory::LoopAnomaly,
            FailureCategory::LengthAnomaly,
            FailureCategory::TruncatedAnomaly,
            FailureCategory::LogicError,
            FailureCategory::ModelCapability,
        ] {
            let text = suggest(category.label(), "");
            if category == FailureCategory::LengthAnomaly {
                assert_eq!(text, DEFAULT_SUGGESTION);
            } else {
                assert_ne!(text, DEFAULT_SUGGESTION, "{:?}", category);
            }
        }
    }

    #[test]
    fn test_root_cause_used_when_category_unmapped() {
        let text = suggest(
            FailureCategory::LengthAnomaly.label(),
            RootCause::TurnLimitExceeded.label(),
        );
        assert!(text.contains("length limit"));
        assert!(suggest("Other", "Repeated failures").contains("retry"));
    }

    #[test]
    fn test_category_wins_over_root_cause() {
        let text = suggest("1. Trajectory Anomaly (Loop)", "3.2 Lengthy due to Repeated");
        assert!(text.contains("loop detection"));
    }

    #[test]
    fn test_default_and_analysis_error() {
        assert_eq!(suggest("", ""), DEFAULT_SUGGESTION);
        assert!(suggest(ANALYSIS_ERROR_CATEGORY, "boom").contains("Analysis itself failed"));
    }
}
