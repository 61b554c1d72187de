//! Database schema constants.
//!
//! Scalar fields get their own columns so the store can be queried directly;
//! transcript, steps, task and tags are stored as JSON text.

/// SQL schema for the trajectories table.
pub const CREATE_TRAJECTORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trajectories (
    trajectory_id       TEXT    PRIMARY KEY,
    data_id             TEXT    NOT NULL,
    task                TEXT    NOT NULL,
    chat_completions    TEXT    NOT NULL,
    steps               TEXT    NOT NULL,

    reward              REAL    NOT NULL DEFAULT 0,
    toolcall_reward     REAL    NOT NULL DEFAULT 0,
    res_reward          REAL    NOT NULL DEFAULT 0,
    exec_time           REAL    NOT NULL DEFAULT 0,

    training_id         TEXT    NOT NULL DEFAULT '',
    epoch_id            INTEGER NOT NULL DEFAULT 0,
    iteration_id        INTEGER NOT NULL DEFAULT 0,
    sample_id           INTEGER NOT NULL DEFAULT 0,
    tree_id             TEXT,

    agent_name          TEXT    NOT NULL DEFAULT '',
    termination_reason  TEXT    NOT NULL DEFAULT '',
    tags                TEXT    NOT NULL DEFAULT '[]',
    notes               TEXT    NOT NULL DEFAULT '',
    is_bookmarked       INTEGER NOT NULL DEFAULT 0,
    source              TEXT    NOT NULL DEFAULT '',

    created_at          TEXT    NOT NULL,
    updated_at          TEXT    NOT NULL
)
"#;

/// SQL schema for classification results, one live row per trajectory.
pub const CREATE_ANALYSIS_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_results (
    trajectory_id   TEXT    PRIMARY KEY,
    is_success      INTEGER NOT NULL,
    category        TEXT    NOT NULL,
    root_cause      TEXT    NOT NULL,
    suggestion      TEXT    NOT NULL,
    analyzed_at     TEXT    NOT NULL
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_trajectories_data_id ON trajectories(data_id);
CREATE INDEX IF NOT EXISTS idx_trajectories_training ON trajectories(training_id, epoch_id, iteration_id);
CREATE INDEX IF NOT EXISTS idx_analysis_results_category ON analysis_results(category)
"#;

/// Returns all schema creation statements in the order they must run.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TRAJECTORIES_TABLE,
        CREATE_ANALYSIS_RESULTS_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const TRAJECTORIES: &str = "trajectories";
    pub const ANALYSIS_RESULTS: &str = "analysis_results";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains(tables::TRAJECTORIES));
        assert!(statements[1].contains(tables::ANALYSIS_RESULTS));
        assert!(statements[2].contains("CREATE INDEX"));
    }
}
