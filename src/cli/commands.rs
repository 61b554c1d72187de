//! CLI command definitions for traj-lens.
//!
//! Every command prints one JSON document to stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::AnalysisService;
use crate::config::AppConfig;
use crate::ingest::{sniff_path, ImportContext, ImportHistoryEntry, ImportResult, Importer};
use crate::metrics::{export_metrics, IngestMetrics};
use crate::stats::{self, Dataset, ToolReturnClass};
use crate::storage::{SqliteTrajectoryStore, TrajectoryStore};

/// Agent trajectory ingestion, failure analysis and training statistics.
#[derive(Parser)]
#[command(name = "traj-lens")]
#[command(about = "Ingest agent trajectories, classify failures and compute training statistics")]
#[command(version)]
#[command(
    long_about = "traj-lens imports agent trajectories from JSON or JSONL files of any size into a SQLite store, classifies failed runs and reports pass rates, reward buckets and process/outcome reward correlation.\n\nExample usage:\n  traj-lens import runs/epoch1.jsonl --db data/trajectories.db\n  traj-lens analyze --report\n  traj-lens stats questions --page 1 --page-size 20"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. TRAJ_LENS_* environment variables override it.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides configuration).
    #[arg(long, global = true, env = "TRAJ_LENS_DB_PATH")]
    pub db: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Detect whether a file is JSON or JSONL without importing it.
    Sniff(SniffArgs),

    /// Import trajectories from one or more JSON/JSONL files.
    Import(ImportArgs),

    /// Classify stored trajectories and persist the results.
    Analyze(AnalyzeArgs),

    /// Print a statistics view over stored trajectories.
    Stats(StatsArgs),
}

#[derive(Parser, Debug)]
pub struct SniffArgs {
    /// File to inspect.
    pub path: PathBuf,

    /// Lines sampled when the first line is not conclusive.
    #[arg(long)]
    pub sample_lines: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct ImportArgs {
    /// Files to import, in order.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Accepted records per bulk insert.
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Write ingestion metrics in Prometheus text format to this file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    /// Trajectory ids to analyze. All stored trajectories when omitted.
    #[arg(long = "id")]
    pub ids: Vec<String>,

    /// Print the aggregate report instead of per-trajectory results.
    #[arg(long)]
    pub report: bool,
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[command(subcommand)]
    pub view: StatsView,
}

#[derive(clap::Subcommand, Debug)]
pub enum StatsView {
    /// Totals, Pass@1 (micro and macro), Pass@K and averages.
    Overview,

    /// Per-question success and difficulty tier.
    Questions {
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        page_size: usize,
    },

    /// Known training run ids.
    Runs,

    /// Per-epoch pass rates for training runs.
    Epochs {
        /// Restrict to these runs. All runs when omitted.
        #[arg(long = "training-id")]
        training_ids: Vec<String>,
    },

    /// Per-iteration pass rates inside the epochs of one run.
    Iterations {
        training_id: String,
        /// Restrict to these epochs. All epochs when omitted.
        #[arg(long = "epoch")]
        epochs: Vec<i64>,
    },

    /// How episodes terminated.
    Termination,

    /// What tool calls returned.
    ToolReturns,

    /// Steps whose tool call returned nothing, timed out or failed to connect.
    UnexpectedTools {
        /// empty, timeout or connection_error.
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Reward range and buckets.
    Rewards,

    /// Kendall correlation between mean step reward and final reward.
    Correlation,

    /// Failed classifications grouped by category.
    Failures,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and execute the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Commands::Sniff(args) => run_sniff_command(&config, args).await,
        Commands::Import(args) => run_import_command(config, args).await,
        Commands::Analyze(args) => run_analyze_command(&config, args).await,
        Commands::Stats(args) => run_stats_command(&config, args.view).await,
    }
}

/// Defaults, then the YAML file, then environment, then CLI flags.
fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::from_yaml_file(path)?.merge_env(|k| std::env::var(k).ok())?,
        None => AppConfig::from_env()?,
    };
    if let Some(db) = db {
        config.db_path = db;
    }
    config.validate()?;
    Ok(config)
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TrajectoryStore>> {
    let store = SqliteTrajectoryStore::open(&config.db_path).await?;
    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output JSON: {}", e))?;
    println!("{}", json);
    Ok(())
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Debug, Serialize)]
struct SniffOutput {
    path: String,
    format: crate::ingest::StreamFormat,
    reason: String,
}

async fn run_sniff_command(config: &AppConfig, args: SniffArgs) -> anyhow::Result<()> {
    let lines = args.sample_lines.unwrap_or(config.sniff_sample_lines);
    let result = sniff_path(&args.path, lines).await;
    print_json(&SniffOutput {
        path: args.path.display().to_string(),
        format: result.format,
        reason: result.reason.to_string(),
    })
}

/// A file that could not be imported at all.
#[derive(Debug, Serialize)]
struct ImportFailure {
    path: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct ImportOutput {
    results: Vec<ImportResult>,
    failures: Vec<ImportFailure>,
    history: Vec<ImportHistoryEntry>,
}

async fn run_import_command(mut config: AppConfig, args: ImportArgs) -> anyhow::Result<()> {
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
        config.validate()?;
    }

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(IngestMetrics::new(&registry)?);
    let context = Arc::new(ImportContext::new(config.history_limit));
    let importer = Importer::new(open_store(&config).await?, config.import_options())
        .with_context(context.clone())
        .with_metrics(metrics);

    let mut results = Vec::with_capacity(args.paths.len());
    let mut failures = Vec::new();
    for path in &args.paths {
        match importer.import_file(path).await {
            Ok(result) => {
                info!(
                    path = %path.display(),
                    imported = result.imported_count,
                    skipped = result.skipped_count,
                    failed = result.failed_count,
                    "{}",
                    result.message
                );
                results.push(result);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Import failed");
                failures.push(ImportFailure {
                    path: path.display().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    context.cleanup_old_tasks(config.task_max_age()).await;

    if let Some(out) = &args.metrics_out {
        std::fs::write(out, export_metrics(&registry))?;
        info!(path = %out.display(), "Metrics written");
    }

    print_json(&ImportOutput {
        history: context.history(config.history_limit).await,
        results,
        failures,
    })
}

// ============================================================================
// Analysis
// ============================================================================

async fn run_analyze_command(config: &AppConfig, args: AnalyzeArgs) -> anyhow::Result<()> {
    let service = AnalysisService::new(
        open_store(config).await?,
        config.classifier_config(),
        config.success_threshold,
    )?;

    let results = if args.ids.is_empty() {
        service.analyze_all().await?
    } else {
        service.batch_analyze(&args.ids).await
    };

    if args.report {
        print_json(&service.report().await?)
    } else {
        print_json(&results)
    }
}

// ============================================================================
// Statistics
// ============================================================================

async fn run_stats_command(config: &AppConfig, view: StatsView) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let dataset = Dataset::load(store.as_ref()).await?;
    let trajectories = dataset.trajectories();

    match view {
        StatsView::Overview => print_json(&stats::overview(&dataset)),
        StatsView::Questions { page, page_size } => {
            print_json(&stats::question_page(&dataset, page, page_size))
        }
        StatsView::Runs => print_json(&stats::training_runs(trajectories)),
        StatsView::Epochs { training_ids } => {
            print_json(&stats::epoch_stats(trajectories, &training_ids))
        }
        StatsView::Iterations {
            training_id,
            epochs,
        } => print_json(&stats::iteration_stats(trajectories, &training_id, &epochs)),
        StatsView::Termination => print_json(&stats::termination_stats(trajectories)),
        StatsView::ToolReturns => print_json(&stats::tool_return_stats(trajectories)),
        StatsView::UnexpectedTools { category, limit } => {
            let category = match category.as_deref() {
                Some(label) => Some(ToolReturnClass::parse(label).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown tool return category '{}'. Expected empty, timeout or connection_error",
                        label
                    )
                })?),
                None => None,
            };
            print_json(&stats::unexpected_tool_contexts(trajectories, category, limit))
        }
        StatsView::Rewards => print_json(&stats::reward_stats(trajectories)),
        StatsView::Correlation => print_json(&stats::process_reward_correlation(trajectories)),
        StatsView::Failures => {
            let service = AnalysisService::new(
                store.clone(),
                config.classifier_config(),
                config.success_threshold,
            )?;
            print_json(&service.failure_distribution().await?)
        }
    }
}
