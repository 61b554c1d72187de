//! Application configuration.
//!
//! Settings come from three layers, later ones overriding earlier ones:
//! built-in defaults, an optional YAML file, and `TRAJ_LENS_*` environment
//! variables. CLI flags override the result at the call site.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::ClassifierConfig;
use crate::ingest::ImportOptions;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or file entry has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for ingestion, classification and statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // Storage
    /// SQLite database file holding trajectories and classification results.
    pub db_path: PathBuf,

    // Ingestion
    /// Number of accepted records per bulk insert.
    pub batch_size: usize,
    /// Accepted-record interval between progress updates.
    pub progress_every: usize,
    /// Interval of the background progress log, in seconds.
    pub progress_log_interval_secs: u64,
    /// Upper bound of the extractor's resync buffer, in bytes.
    pub max_record_bytes: usize,
    /// Lines sampled when sniffing a file without a known extension.
    pub sniff_sample_lines: usize,
    /// Directories imports may read from. Empty means unrestricted.
    pub allowed_directories: Vec<PathBuf>,

    // Classification
    /// Turn limit the agent ran under; transcripts longer than twice this are flagged.
    pub max_turn_limit: usize,
    pub context_char_limit: usize,
    /// Rewards strictly above this count as success when classifying.
    pub success_threshold: f64,

    // Import bookkeeping
    /// Number of finished runs kept in the import history.
    pub history_limit: usize,
    /// Age after which finished import tasks are dropped from the task map.
    pub task_max_age_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/trajectories.db"),

            batch_size: 500,
            progress_every: 100,
            progress_log_interval_secs: 5,
            max_record_bytes: 64 * 1024 * 1024,
            sniff_sample_lines: 10,
            allowed_directories: Vec::new(),

            max_turn_limit: 8,
            context_char_limit: 32_000,
            success_threshold: 0.5,

            history_limit: 100,
            task_max_age_secs: 3600,
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file; missing keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables on top of the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `TRAJ_LENS_DB_PATH`: SQLite database path (default: data/trajectories.db)
    /// - `TRAJ_LENS_BATCH_SIZE`: Records per bulk insert (default: 500)
    /// - `TRAJ_LENS_PROGRESS_EVERY`: Accepted records between progress updates (default: 100)
    /// - `TRAJ_LENS_PROGRESS_LOG_SECS`: Background progress log interval (default: 5)
    /// - `TRAJ_LENS_MAX_RECORD_BYTES`: Resync buffer cap (default: 64 MiB)
    /// - `TRAJ_LENS_SNIFF_LINES`: Lines sampled by the format sniffer (default: 10)
    /// - `TRAJ_LENS_ALLOWED_DIRS`: Colon-separated import directories (default: unrestricted)
    /// - `TRAJ_LENS_MAX_TURN_LIMIT`: Agent turn limit (default: 8)
    /// - `TRAJ_LENS_CONTEXT_CHAR_LIMIT`: Context size limit (default: 32000)
    /// - `TRAJ_LENS_SUCCESS_THRESHOLD`: Success reward threshold (default: 0.5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Applies environment overrides read through `lookup`.
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("TRAJ_LENS_DB_PATH") {
            self.db_path = PathBuf::from(val);
        }

        if let Some(val) = lookup("TRAJ_LENS_BATCH_SIZE") {
            self.batch_size = parse_env_value(&val, "TRAJ_LENS_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_PROGRESS_EVERY") {
            self.progress_every = parse_env_value(&val, "TRAJ_LENS_PROGRESS_EVERY")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_PROGRESS_LOG_SECS") {
            self.progress_log_interval_secs =
                parse_env_value(&val, "TRAJ_LENS_PROGRESS_LOG_SECS")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_MAX_RECORD_BYTES") {
            self.max_record_bytes = parse_env_value(&val, "TRAJ_LENS_MAX_RECORD_BYTES")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_SNIFF_LINES") {
            self.sniff_sample_lines = parse_env_value(&val, "TRAJ_LENS_SNIFF_LINES")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_ALLOWED_DIRS") {
            self.allowed_directories = val
                .split(':')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(val) = lookup("TRAJ_LENS_MAX_TURN_LIMIT") {
            self.max_turn_limit = parse_env_value(&val, "TRAJ_LENS_MAX_TURN_LIMIT")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_CONTEXT_CHAR_LIMIT") {
            self.context_char_limit = parse_env_value(&val, "TRAJ_LENS_CONTEXT_CHAR_LIMIT")?;
        }

        if let Some(val) = lookup("TRAJ_LENS_SUCCESS_THRESHOLD") {
            self.success_threshold = parse_env_value(&val, "TRAJ_LENS_SUCCESS_THRESHOLD")?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.progress_every == 0 {
            return Err(ConfigError::ValidationFailed(
                "progress_every must be greater than 0".to_string(),
            ));
        }

        if self.max_record_bytes < 1024 {
            return Err(ConfigError::ValidationFailed(
                "max_record_bytes must be at least 1024".to_string(),
            ));
        }

        if self.sniff_sample_lines == 0 {
            return Err(ConfigError::ValidationFailed(
                "sniff_sample_lines must be greater than 0".to_string(),
            ));
        }

        if !self.success_threshold.is_finite() {
            return Err(ConfigError::ValidationFailed(
                "success_threshold must be a finite number".to_string(),
            ));
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "db_path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_allowed_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.allowed_directories.push(dir.into());
        self
    }

    /// Ingestion options derived from this configuration.
    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            batch_size: self.batch_size,
            progress_every: self.progress_every,
            progress_log_interval: Duration::from_secs(self.progress_log_interval_secs.max(1)),
            max_record_bytes: self.max_record_bytes,
            sniff_sample_lines: self.sniff_sample_lines,
            allowed_directories: self.allowed_directories.clone(),
        }
    }

    /// Classifier settings derived from this configuration.
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            max_turn_limit: self.max_turn_limit,
            context_char_limit: self.context_char_limit,
            ..ClassifierConfig::default()
        }
    }

    pub fn task_max_age(&self) -> Duration {
        Duration::from_secs(self.task_max_age_secs)
    }
}

/// Parse an environment variable value into the requested type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.progress_every, 100);
        assert_eq!(config.max_turn_limit, 8);
        assert_eq!(config.sniff_sample_lines, 10);
        assert!((config.success_threshold - 0.5).abs() < f64::EPSILON);
        assert!(config.allowed_directories.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_env_overrides() {
        let config = AppConfig::default()
            .merge_env(lookup_from(&[
                ("TRAJ_LENS_BATCH_SIZE", "50"),
                ("TRAJ_LENS_ALLOWED_DIRS", "/tmp:/data/in"),
                ("TRAJ_LENS_SUCCESS_THRESHOLD", "0.0"),
            ]))
            .expect("valid overrides");
        assert_eq!(config.batch_size, 50);
        assert_eq!(
            config.allowed_directories,
            vec![PathBuf::from("/tmp"), PathBuf::from("/data/in")]
        );
        assert_eq!(config.success_threshold, 0.0);
    }

    #[test]
    fn test_merge_env_invalid_value() {
        let result = AppConfig::default().merge_env(lookup_from(&[("TRAJ_LENS_BATCH_SIZE", "lots")]));
        let err = result.expect_err("should reject non-numeric batch size");
        assert!(err.to_string().contains("TRAJ_LENS_BATCH_SIZE"));
    }

    #[test]
    fn test_validation_zero_batch() {
        let config = AppConfig::default().with_batch_size(0);
        let err = config.validate().expect_err("zero batch size is invalid");
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_from_yaml_file_partial() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "batch_size: 20\nmax_turn_limit: 12").expect("write yaml");

        let config = AppConfig::from_yaml_file(file.path()).expect("valid yaml");
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_turn_limit, 12);
        assert_eq!(config.progress_every, 100);
    }

    #[test]
    fn test_derived_options() {
        let config = AppConfig::default().with_allowed_directory("/tmp");
        let opts = config.import_options();
        assert_eq!(opts.batch_size, 500);
        assert_eq!(opts.allowed_directories, vec![PathBuf::from("/tmp")]);

        let classifier = config.classifier_config();
        assert_eq!(classifier.max_turn_limit, 8);
    }
}
