//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Values left unset fall back to the
//! configuration file.

use crate::config::OutlierPolicy;
use clap::Parser;
use std::path::PathBuf;

/// buildtrend - build-time trends for GitHub Actions workflows
///
/// Collects the duration of every successful run of a workflow, breaks
/// recent runs down into per-package build times from their colcon logs,
/// and writes both series as CSV and JSON.
///
/// Examples:
///   buildtrend --token $GITHUB_TOKEN
///   buildtrend --repo ros2/ros2 --workflow ci.yaml --build-log "ci/5_Build.txt"
///   buildtrend --accurate --outlier-policy fast-only
///   buildtrend --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// GitHub token used as bearer credential
    #[arg(
        short,
        long,
        env = "GITHUB_TOKEN",
        hide_env_values = true,
        required_unless_present = "init_config"
    )]
    pub token: Option<String>,

    /// Repository to analyze (owner/name)
    #[arg(short, long, value_name = "OWNER/NAME")]
    pub repo: Option<String>,

    /// Workflow file name or id
    #[arg(short, long, value_name = "WORKFLOW")]
    pub workflow: Option<String>,

    /// Path of the build-step log inside the run log archive
    #[arg(long, value_name = "PATH")]
    pub build_log: Option<String>,

    /// Directory for cached log archives
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .buildtrend.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Sum job durations instead of using wall-clock run time
    ///
    /// Needs one extra API request per run; mind the rate limit.
    #[arg(long)]
    pub accurate: bool,

    /// Runs longer than this many hours are dropped as outliers
    #[arg(long, value_name = "HOURS")]
    pub outlier_ceiling_hours: Option<f64>,

    /// When to apply the outlier ceiling
    #[arg(long, value_name = "POLICY")]
    pub outlier_policy: Option<OutlierPolicy>,

    /// Only analyze logs of runs created within this many days
    #[arg(long, value_name = "DAYS")]
    pub window_days: Option<i64>,

    /// Number of concurrent log downloads
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Stop fetching logs after this many seconds and write what was collected
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Output CSV file
    #[arg(long, value_name = "FILE")]
    pub csv_output: Option<PathBuf>,

    /// Output JSON file
    #[arg(long, value_name = "FILE")]
    pub json_output: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .buildtrend.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err("GitHub token must not be empty".to_string());
        }

        if let Some(ref repo) = self.repo {
            let parts: Vec<&str> = repo.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                return Err(format!("Repository must be in owner/name form: {}", repo));
            }
        }

        if let Some(hours) = self.outlier_ceiling_hours {
            if !(hours > 0.0) {
                return Err("Outlier ceiling must be a positive number of hours".to_string());
            }
        }

        if let Some(days) = self.window_days {
            if days < 0 {
                return Err("Window must not be negative".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if self.deadline == Some(0) {
            return Err("Deadline must be at least 1 second".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
