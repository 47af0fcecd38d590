//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.buildtrend.toml` files.

use crate::github::MAX_PER_PAGE;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".buildtrend.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// GitHub API settings.
    #[serde(default)]
    pub github: GithubConfig,

    /// Log analysis and filtering settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Output file settings.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Which runs the outlier ceiling applies to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum OutlierPolicy {
    /// Filter runs regardless of how durations were measured.
    #[default]
    Always,
    /// Filter only wall-clock (fast mode) durations.
    FastOnly,
    /// Keep every run.
    Never,
}

impl OutlierPolicy {
    /// Whether the ceiling applies for the given measurement mode.
    pub fn applies(self, accurate: bool) -> bool {
        match self {
            OutlierPolicy::Always => true,
            OutlierPolicy::FastOnly => !accurate,
            OutlierPolicy::Never => false,
        }
    }
}

/// GitHub API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// REST API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Repository as `owner/name`.
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Workflow file name or numeric id.
    #[serde(default = "default_workflow")]
    pub workflow: String,

    /// Page size for run listings.
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of retries on transport or server errors.
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Sum job durations instead of using wall-clock run time.
    /// Costs one extra request per run.
    #[serde(default)]
    pub accurate: bool,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            repo: default_repo(),
            workflow: default_workflow(),
            per_page: default_per_page(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
            accurate: false,
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_repo() -> String {
    "autowarefoundation/autoware".to_string()
}

fn default_workflow() -> String {
    "build-main-self-hosted.yaml".to_string()
}

fn default_per_page() -> u32 {
    100
}

fn default_timeout() -> u64 {
    300
}

fn default_retries() -> usize {
    3
}

/// Log analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Path of the build-step log inside the run's log archive.
    #[serde(default = "default_build_log")]
    pub build_log: String,

    /// Runs longer than this are treated as outliers.
    #[serde(default = "default_outlier_ceiling_hours")]
    pub outlier_ceiling_hours: f64,

    #[serde(default)]
    pub outlier_policy: OutlierPolicy,

    /// Only runs created within this many days get their logs analyzed.
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// Number of log downloads in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            build_log: default_build_log(),
            outlier_ceiling_hours: default_outlier_ceiling_hours(),
            outlier_policy: OutlierPolicy::default(),
            window_days: default_window_days(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_build_log() -> String {
    "build-main-self-hosted/9_Build.txt".to_string()
}

fn default_outlier_ceiling_hours() -> f64 {
    100.0
}

fn default_window_days() -> i64 {
    90 // GitHub's default log retention
}

fn default_concurrency() -> usize {
    4
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding cached log bundles.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

/// Output file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// CSV file with one `Date,Duration (hours)` row per run.
    #[serde(default = "default_csv_output")]
    pub csv: PathBuf,

    /// JSON document with workflow and package time series.
    #[serde(default = "default_json_output")]
    pub json: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv: default_csv_output(),
            json: default_json_output(),
        }
    }
}

fn default_csv_output() -> PathBuf {
    PathBuf::from("github_action_data.csv")
}

fn default_json_output() -> PathBuf {
    PathBuf::from("github_action_data.json")
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Only values given explicitly on the command line override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref repo) = args.repo {
            self.github.repo = repo.clone();
        }
        if let Some(ref workflow) = args.workflow {
            self.github.workflow = workflow.clone();
        }
        if let Some(timeout) = args.timeout {
            self.github.timeout_seconds = timeout;
        }
        if args.accurate {
            self.github.accurate = true;
        }

        if let Some(ref build_log) = args.build_log {
            self.analysis.build_log = build_log.clone();
        }
        if let Some(hours) = args.outlier_ceiling_hours {
            self.analysis.outlier_ceiling_hours = hours;
        }
        if let Some(policy) = args.outlier_policy {
            self.analysis.outlier_policy = policy;
        }
        if let Some(days) = args.window_days {
            self.analysis.window_days = days;
        }
        if let Some(concurrency) = args.concurrency {
            self.analysis.concurrency = concurrency;
        }

        if let Some(ref dir) = args.cache_dir {
            self.cache.dir = dir.clone();
        }

        if let Some(ref csv) = args.csv_output {
            self.output.csv = csv.clone();
        }
        if let Some(ref json) = args.json_output {
            self.output.json = json.clone();
        }
    }

    /// Check the merged settings for values no collection can run with.
    pub fn validate(&self) -> Result<()> {
        let parts: Vec<&str> = self.github.repo.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            bail!("github.repo must be in owner/name form: {}", self.github.repo);
        }
        if self.github.workflow.trim().is_empty() {
            bail!("github.workflow must not be empty");
        }
        if !(1..=MAX_PER_PAGE).contains(&self.github.per_page) {
            bail!(
                "github.per_page must be between 1 and {}, got {}",
                MAX_PER_PAGE,
                self.github.per_page
            );
        }
        if self.github.timeout_seconds == 0 {
            bail!("github.timeout_seconds must be at least 1");
        }
        if !(self.analysis.outlier_ceiling_hours > 0.0) {
            bail!(
                "analysis.outlier_ceiling_hours must be positive, got {}",
                self.analysis.outlier_ceiling_hours
            );
        }
        if self.analysis.window_days < 0 {
            bail!(
                "analysis.window_days must not be negative, got {}",
                self.analysis.window_days
            );
        }
        if self.analysis.concurrency == 0 {
            bail!("analysis.concurrency must be at least 1");
        }
        if self.analysis.build_log.trim().is_empty() {
            bail!("analysis.build_log must not be empty");
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
