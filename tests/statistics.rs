//! Statistics and classification tests against the public API.

use std::sync::Arc;

use traj_lens::analysis::{
    AnalysisService, ClassifierConfig, FailureCategory, FailureClassifier, NumericContext,
    RootCause,
};
use traj_lens::stats::{
    self, process_reward_correlation, Dataset, DifficultyTier, Interpretation, Strategy,
};
use traj_lens::storage::{MemoryTrajectoryStore, SqliteTrajectoryStore, TrajectoryStore};
use traj_lens::trajectory::{Message, Step, Trajectory};

fn attempt(id: &str, data_id: &str, reward: f64) -> Trajectory {
    Trajectory::new(id, data_id).with_reward(reward)
}

fn with_process(id: &str, step_reward: f64, reward: f64) -> Trajectory {
    attempt(id, "q", reward).with_steps(vec![
        Step {
            step_id: 1,
            reward: step_reward,
            ..Default::default()
        },
        Step {
            step_id: 2,
            reward: step_reward,
            ..Default::default()
        },
    ])
}

#[test]
fn test_single_question_pass_rates() {
    let ds = Dataset::new(
        vec![
            attempt("t1", "q1", 1.0),
            attempt("t2", "q1", 1.0),
            attempt("t3", "q1", 0.0),
            attempt("t4", "q1", 0.0),
        ],
        Vec::new(),
    );

    assert_eq!(stats::pass_at_1(&ds), 0.5);
    assert_eq!(stats::pass_at_1_macro(&ds), 0.5);
    assert_eq!(stats::pass_at_k(&ds), 1.0);

    let rows = stats::question_stats(&ds);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].difficulty, DifficultyTier::Medium);
    assert_eq!(rows[0].difficulty.as_str(), "medium");
}

#[test]
fn test_zero_trajectories_report_zero_ratios() {
    let ds = Dataset::default();
    let overview = stats::overview(&ds);
    assert_eq!(overview.pass_at_1, 0.0);
    assert_eq!(overview.pass_at_1_macro, 0.0);
    assert_eq!(overview.pass_at_k, 0.0);

    let termination = stats::termination_stats(&[]);
    assert_eq!(termination.total, 0);
    assert_eq!(termination.unexpected.ratio, 0.0);
    assert_eq!(stats::tool_return_stats(&[]).unexpected.ratio, 0.0);
    assert_eq!(stats::reward_stats(&[]).categories.perfect_score.ratio, 0.0);
    assert!(stats::epoch_stats(&[], &[]).is_empty());

    let correlation = process_reward_correlation(&[]);
    assert_eq!(correlation.kendall_tau, 0.0);
    assert_eq!(correlation.p_value, 1.0);
}

#[test]
fn test_strong_positive_correlation_suggests_beam_search() {
    let trajectories = vec![
        with_process("a", 0.1, 0.0),
        with_process("b", 0.2, 0.0),
        with_process("c", 0.8, 1.0),
        with_process("d", 0.9, 1.0),
    ];
    let report = process_reward_correlation(&trajectories);

    assert_eq!(report.sample_size, 4);
    assert!(report.kendall_tau > 0.7);
    assert_eq!(report.interpretation, Interpretation::StrongPositiveCorrelation);
    assert_eq!(report.suggested_strategy, Strategy::BeamSearch);
    assert_eq!(report.scatter_data.x, vec![0.1, 0.2, 0.8, 0.9]);
    assert_eq!(report.scatter_data.trajectory_ids, vec!["a", "b", "c", "d"]);
}

#[test]
fn test_format_error_outranks_repeater() {
    let classifier = FailureClassifier::new(ClassifierConfig::default()).expect("classifier");
    let call = "[tool] search(\"rust\")";
    let transcript = vec![
        Message::user("find it"),
        Message::assistant(call),
        Message::tool("no results"),
        Message::assistant(call),
        Message::tool("no results"),
        Message::assistant(call),
    ];

    let diagnosis = classifier.classify(&transcript, &NumericContext::default());
    assert_eq!(diagnosis.category, FailureCategory::FormatAnomaly);
    assert_eq!(diagnosis.root_cause, RootCause::InvalidToolFormat);
}

#[test]
fn test_empty_transcript_is_unknown() {
    let classifier = FailureClassifier::new(ClassifierConfig::default()).expect("classifier");
    let diagnosis = classifier.classify(&[], &NumericContext::default());
    assert_eq!(diagnosis.category, FailureCategory::ModelCapability);
    assert_eq!(
        diagnosis.root_cause.label(),
        "4.0 Unknown Error / General Response Error"
    );
}

#[tokio::test]
async fn test_classifications_override_reward_fallback() {
    let store = Arc::new(MemoryTrajectoryStore::new());
    store
        .insert_batch(&[
            attempt("t1", "q1", 1.0),
            attempt("t2", "q1", 0.3),
            attempt("t3", "q2", 0.0),
        ])
        .await
        .expect("insert");

    // Before analysis, success falls back to reward > 0.
    let before = Dataset::load(store.as_ref()).await.expect("load");
    assert!((stats::pass_at_1(&before) - 2.0 / 3.0).abs() < 1e-9);

    // Analysis applies the 0.5 threshold, so t2 stops counting as a success.
    let service = AnalysisService::new(store.clone(), ClassifierConfig::default(), 0.5)
        .expect("service");
    service.analyze_all().await.expect("analysis");

    let after = Dataset::load(store.as_ref()).await.expect("load");
    assert!((stats::pass_at_1(&after) - 1.0 / 3.0).abs() < 1e-9);
    assert!((stats::pass_at_1_macro(&after) - 0.25).abs() < 1e-9);
    assert_eq!(stats::pass_at_k(&after), 0.5);
}

#[tokio::test]
async fn test_sqlite_round_trip_for_statistics() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteTrajectoryStore::open(dir.path().join("stats.db"))
        .await
        .expect("open store");

    let mut t = with_process("a-run-1-2-0", 0.4, 1.0);
    t.training_id = "run".to_string();
    t.epoch_id = 1;
    t.iteration_id = 2;
    t.termination_reason = "max_steps reached".to_string();
    store.insert_batch(&[t]).await.expect("insert");

    let ds = Dataset::load(&store).await.expect("load");
    assert_eq!(stats::training_runs(ds.trajectories()), vec!["run".to_string()]);

    let report = stats::iteration_stats(ds.trajectories(), "run", &[]);
    assert_eq!(report.epochs[0].epoch_id, 1);
    assert_eq!(report.epochs[0].iterations[0].iteration, 2);

    let termination = stats::termination_stats(ds.trajectories());
    assert_eq!(termination.categories.truncation.count, 1);
    assert_eq!(termination.unexpected.ratio, 1.0);
    assert_eq!(stats::tool_return_stats(ds.trajectories()).categories.empty.count, 2);
}
