//! buildtrend - Build-time trends for GitHub Actions workflows
//!
//! A CLI tool that collects the duration of every successful run of a
//! workflow, breaks recent runs down into per-package build times from
//! their colcon logs, and writes both series as CSV and JSON datasets.
//!
//! Exit codes:
//!   0 - Success (including a partial report after cancellation)
//!   1 - Runtime error (configuration, run listing, output, etc.)

mod analysis;
mod analyzer;
mod cache;
mod cli;
mod config;
mod error;
mod github;
mod models;
mod report;

use analysis::{AggregationPipeline, PipelineConfig};
use analyzer::ColconLogAnalyzer;
use anyhow::{Context, Result};
use cache::CacheStore;
use cli::Args;
use config::{Config, CONFIG_FILE_NAME};
use github::{ClientConfig, WorkflowClient};
use indicatif::{ProgressBar, ProgressStyle};
use models::AggregatedReport;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("buildtrend v{}", env!("CARGO_PKG_VERSION"));
    debug!(
        "Arguments: repo={:?} workflow={:?} accurate={}",
        args.repo, args.workflow, args.accurate
    );

    if let Err(e) = run_collection(args).await {
        error!("Collection failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle --init-config: generate a default .buildtrend.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to set the repository, workflow, build log and filters.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run one complete collection pass and write the datasets.
async fn run_collection(args: Args) -> Result<()> {
    let start_time = Instant::now();

    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    let token = args
        .token
        .clone()
        .context("A GitHub token is required (--token or GITHUB_TOKEN)")?;

    let client = WorkflowClient::new(ClientConfig {
        api_url: config.github.api_url.clone(),
        token,
        per_page: config.github.per_page,
        timeout_seconds: config.github.timeout_seconds,
        retries: config.github.retries,
        ..ClientConfig::default()
    })?;

    let cache = CacheStore::open(&config.cache.dir).with_context(|| {
        format!(
            "Failed to open cache directory {}",
            config.cache.dir.display()
        )
    })?;

    let mut pipeline = AggregationPipeline::new(
        client,
        cache,
        ColconLogAnalyzer::new(),
        PipelineConfig::from(&config),
    );
    if !args.quiet {
        pipeline = pipeline.with_progress(fetch_progress_bar());
    }

    let settings = pipeline.config();
    println!(
        "📥 Collecting runs of {} in {}",
        settings.workflow_id, settings.repo
    );
    println!(
        "   Mode: {}",
        if settings.accurate {
            "accurate (sum of job durations)"
        } else {
            "fast (wall-clock duration)"
        }
    );
    println!("   Build log: {}", settings.build_log);
    println!("   Cache: {}", config.cache.dir.display());

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, args.deadline);

    let report = pipeline
        .run(&cancel)
        .await
        .context("Failed to collect workflow runs")?;

    if cancel.is_cancelled() {
        warn!("Collection was cancelled; writing a partial report");
    }
    if report.package_time.is_empty() {
        warn!("No package build times were collected");
    }

    report::write_csv_report(&report, &config.output.csv)?;
    report::write_json_report(&report, &config.output.json)?;

    print_summary(&report, start_time.elapsed().as_secs_f64());
    println!(
        "\n✅ Done! Data saved to {} and {}",
        config.output.csv.display(),
        config.output.json.display()
    );

    Ok(())
}

/// Cancel `token` on Ctrl-C and, if set, after `deadline` seconds.
fn spawn_cancel_triggers(token: &CancellationToken, deadline: Option<u64>) {
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing with the runs collected so far");
            on_signal.cancel();
        }
    });

    if let Some(secs) = deadline {
        let on_deadline = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = on_deadline.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    warn!("Deadline of {}s reached, finishing with the runs collected so far", secs);
                    on_deadline.cancel();
                }
            }
        });
    }
}

fn fetch_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} runs ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

fn print_summary(report: &AggregatedReport, duration: f64) {
    let stats = &report.stats;

    println!("\n📊 Collection Summary:");
    println!("   Runs listed: {}", stats.runs_listed);
    println!("   Outliers dropped: {}", stats.outliers_dropped);
    println!(
        "   Logs analyzed: {} ({} from cache, {} downloaded)",
        stats.analyzed(),
        stats.cache_hits,
        stats.fetched
    );
    println!(
        "   Skipped: {} | Outside window: {}",
        stats.skipped, stats.outside_window
    );
    if stats.parse_gaps > 0 {
        println!("   Package markers without a duration: {}", stats.parse_gaps);
    }
    println!("   Packages tracked: {}", report.package_time.len());

    if let Some((entry, details)) = report.latest_details() {
        println!(
            "\n🐢 Slowest packages of run {} ({}):",
            entry.run_id,
            entry.date.format("%Y-%m-%d %H:%M")
        );
        for (package, secs) in analysis::slowest_packages(details, 5) {
            println!("     {:>9.1}s  {}", secs, package);
        }
    }

    println!("\n   Duration: {:.1}s", duration);
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
