//! Command-line interface for traj-lens.
//!
//! Provides commands for format detection, import, failure analysis and
//! statistics views.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, StatsView};
