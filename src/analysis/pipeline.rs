//! The aggregation pipeline.
//!
//! Lists the workflow's runs, drops outliers, fetches and analyzes the
//! build logs of recent runs through the cache, and merges everything
//! into one [`AggregatedReport`].

use super::aggregator::{
    apply_outlier_filter, is_recent, summarize_packages, ReportBuilder, RunOutcome, SkipReason,
};
use crate::analyzer::LogAnalyzer;
use crate::cache::{cache_key, CacheStore, Cached};
use crate::config::{Config, OutlierPolicy};
use crate::error::FetchError;
use crate::github::RunSource;
use crate::models::{AggregatedReport, LogBundle, WorkflowRun};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub repo: String,
    pub workflow_id: String,
    /// Path of the build-step log inside the log archive.
    pub build_log: String,
    pub accurate: bool,
    /// Outlier ceiling in seconds.
    pub outlier_ceiling: f64,
    pub outlier_policy: OutlierPolicy,
    pub window_days: i64,
    /// Log fetches in flight at once.
    pub concurrency: usize,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            repo: config.github.repo.clone(),
            workflow_id: config.github.workflow.clone(),
            build_log: config.analysis.build_log.clone(),
            accurate: config.github.accurate,
            outlier_ceiling: config.analysis.outlier_ceiling_hours * 3600.0,
            outlier_policy: config.analysis.outlier_policy,
            window_days: config.analysis.window_days,
            concurrency: config.analysis.concurrency.max(1),
        }
    }
}

/// Collects workflow and package build times for one workflow.
pub struct AggregationPipeline<S, A> {
    source: S,
    cache: CacheStore,
    analyzer: A,
    config: PipelineConfig,
    progress: Option<ProgressBar>,
}

impl<S: RunSource, A: LogAnalyzer> AggregationPipeline<S, A> {
    pub fn new(source: S, cache: CacheStore, analyzer: A, config: PipelineConfig) -> Self {
        Self {
            source,
            cache,
            analyzer,
            config,
            progress: None,
        }
    }

    /// Advance `bar` once per processed run.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline against the current time.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<AggregatedReport, FetchError> {
        self.run_at(Utc::now(), cancel).await
    }

    /// Run the pipeline, measuring run age against `now`.
    ///
    /// Fails only when the run list cannot be obtained. Once the list is
    /// known, every failure is local to its run, and cancellation yields
    /// the partial report with unfinished runs marked as cancelled.
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AggregatedReport, FetchError> {
        let listing = self.source.list_runs(
            &self.config.repo,
            &self.config.workflow_id,
            self.config.accurate,
        );
        let runs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = listing => result?,
        };

        let runs_listed = runs.len();
        let (runs, outliers_dropped) = apply_outlier_filter(
            runs,
            self.config.outlier_ceiling,
            self.config.outlier_policy,
            self.config.accurate,
        );
        info!(
            "Listed {} runs of {} ({} outliers dropped)",
            runs_listed, self.config.workflow_id, outliers_dropped
        );

        if let Some(ref bar) = self.progress {
            bar.set_length(runs.len() as u64);
        }

        // `buffered` yields in input order, so outcomes line up with `runs`.
        let outcomes: Vec<RunOutcome> = stream::iter(&runs)
            .map(|run| self.process_run(run, now, cancel))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        if let Some(ref bar) = self.progress {
            bar.finish_and_clear();
        }

        let mut builder = ReportBuilder::new(runs_listed, outliers_dropped);
        for (run, outcome) in runs.iter().zip(outcomes) {
            builder.record(run, outcome);
        }

        let report = builder.finish();
        info!(
            "Analyzed {} runs ({} from cache), {} skipped, {} outside the window",
            report.stats.analyzed(),
            report.stats.cache_hits,
            report.stats.skipped,
            report.stats.outside_window
        );
        Ok(report)
    }

    async fn process_run(
        &self,
        run: &WorkflowRun,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let outcome = self.analyze_run(run, now, cancel).await;
        if let Some(ref bar) = self.progress {
            bar.inc(1);
        }
        outcome
    }

    async fn analyze_run(
        &self,
        run: &WorkflowRun,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if !is_recent(run, now, self.config.window_days) {
            debug!("Run {} is older than {} days", run.id, self.config.window_days);
            return RunOutcome::Skipped(SkipReason::OutsideWindow);
        }
        if cancel.is_cancelled() {
            return RunOutcome::Skipped(SkipReason::Cancelled);
        }

        let key = cache_key(&self.config.repo, run.id);
        let fetch = self.cache.get_or_compute_with_status(&key, || {
            self.source.get_run_logs(&self.config.repo, run.id)
        });
        let result: Result<Cached<LogBundle>, FetchError> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = fetch => result,
        };

        let cached = match result {
            Ok(cached) => cached,
            Err(FetchError::Cancelled) => {
                debug!("Log fetch for run {} cancelled", run.id);
                return RunOutcome::Skipped(SkipReason::Cancelled);
            }
            Err(e) => {
                warn!("Log for run {} cannot be fetched: {}", run.id, e);
                return RunOutcome::Skipped(SkipReason::from(&e));
            }
        };

        let Some(log_text) = cached.value.get(&self.config.build_log) else {
            warn!(
                "Log archive of run {} has no entry {}",
                run.id, self.config.build_log
            );
            debug!(
                "Entries of run {}: {}",
                run.id,
                cached.value.paths().collect::<Vec<_>>().join(", ")
            );
            return RunOutcome::Skipped(SkipReason::MissingBuildLog);
        };

        let analysis = self.analyzer.analyze(log_text);
        for gap in &analysis.gaps {
            debug!("Run {}: no duration for {} ({})", run.id, gap.package, gap.reason);
        }
        if !analysis.gaps.is_empty() {
            info!(
                "Run {}: {} packages without a duration",
                run.id,
                analysis.gaps.len()
            );
        }

        RunOutcome::Analyzed {
            status: cached.status,
            gaps: analysis.gaps.len(),
            details: summarize_packages(analysis.packages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ColconLogAnalyzer;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const REPO: &str = "acme/robot";
    const BUILD_LOG: &str = "build/9_Build.txt";

    #[derive(Default)]
    struct FakeSource {
        runs: Vec<WorkflowRun>,
        logs: HashMap<u64, LogBundle>,
        /// Runs whose log fetch never completes.
        hang: HashSet<u64>,
        /// Runs whose log fetch fails with this HTTP status.
        failing: HashMap<u64, u16>,
        log_calls: AtomicUsize,
    }

    #[async_trait]
    impl RunSource for FakeSource {
        async fn list_runs(
            &self,
            _repo: &str,
            _workflow_id: &str,
            _accurate: bool,
        ) -> Result<Vec<WorkflowRun>, FetchError> {
            Ok(self.runs.clone())
        }

        async fn get_run_logs(&self, _repo: &str, run_id: u64) -> Result<LogBundle, FetchError> {
            self.log_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(&run_id) {
                std::future::pending::<()>().await;
            }
            if let Some(&status) = self.failing.get(&run_id) {
                return Err(FetchError::Status {
                    url: format!("/runs/{}/logs", run_id),
                    status,
                });
            }
            self.logs
                .get(&run_id)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(format!("logs of run {}", run_id)))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn run(id: u64, days_ago: i64, duration: f64) -> WorkflowRun {
        let created_at = now() - Duration::days(days_ago);
        WorkflowRun {
            id,
            created_at,
            updated_at: created_at,
            jobs_url: String::new(),
            duration,
        }
    }

    fn colcon_bundle(packages: &[(&str, f64)]) -> LogBundle {
        let mut text = String::new();
        for (name, secs) in packages {
            text.push_str(&format!("Starting >>> {}\n", name));
            text.push_str(&format!("Finished <<< {} [{:.1}s]\n", name, secs));
        }
        let mut bundle = LogBundle::new();
        bundle.insert(BUILD_LOG, text);
        bundle
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            repo: REPO.to_string(),
            workflow_id: "build.yaml".to_string(),
            build_log: BUILD_LOG.to_string(),
            accurate: false,
            outlier_ceiling: 100.0 * 3600.0,
            outlier_policy: OutlierPolicy::Always,
            window_days: 90,
            concurrency: 4,
        }
    }

    fn pipeline(
        source: FakeSource,
        cache_dir: &TempDir,
    ) -> AggregationPipeline<FakeSource, ColconLogAnalyzer> {
        let cache = CacheStore::open(cache_dir.path()).unwrap();
        AggregationPipeline::new(source, cache, ColconLogAnalyzer::new(), config())
    }

    #[tokio::test]
    async fn test_packages_merge_across_runs() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource {
            runs: vec![run(1, 2, 3600.0), run(2, 1, 7200.0)],
            logs: HashMap::from([
                (1, colcon_bundle(&[("x", 10.0), ("y", 5.0)])),
                (2, colcon_bundle(&[("x", 12.0)])),
            ]),
            ..FakeSource::default()
        };

        let report = pipeline(source, &dir)
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.package_time.get("x"), Some(&[10.0, 12.0][..]));
        assert_eq!(report.package_time.get("y"), Some(&[5.0][..]));
        assert_eq!(report.workflow_time.len(), 2);
        assert_eq!(report.stats.fetched, 2);
    }

    #[tokio::test]
    async fn test_missing_logs_skip_only_that_run() {
        let dir = TempDir::new().unwrap();
        let runs: Vec<WorkflowRun> = (1..=5).map(|id| run(id, 10 - id as i64, 60.0)).collect();
        let logs = [1, 2, 4, 5]
            .into_iter()
            .map(|id| (id, colcon_bundle(&[("pkg", id as f64)])))
            .collect();
        let source = FakeSource {
            runs,
            logs,
            ..FakeSource::default()
        };

        let report = pipeline(source, &dir)
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<u64> = report.workflow_time.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(report.workflow_time[2].details.is_none());
        assert_eq!(report.package_time.get("pkg"), Some(&[1.0, 2.0, 4.0, 5.0][..]));
        assert_eq!(report.stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_outlier_ceiling_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let ceiling = 100.0 * 3600.0;
        let source = FakeSource {
            runs: vec![run(1, 1, ceiling), run(2, 1, ceiling + 1.0)],
            ..FakeSource::default()
        };

        let report = pipeline(source, &dir)
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<u64> = report.workflow_time.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(report.stats.outliers_dropped, 1);
    }

    #[tokio::test]
    async fn test_old_runs_are_reported_without_fetching() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource {
            runs: vec![run(1, 91, 60.0), run(2, 90, 60.0)],
            logs: HashMap::from([(2, colcon_bundle(&[("x", 1.0)]))]),
            ..FakeSource::default()
        };

        let pipeline = pipeline(source, &dir);
        let report = pipeline
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.workflow_time.len(), 2);
        assert!(report.workflow_time[0].details.is_none());
        assert!(report.workflow_time[1].details.is_some());
        assert_eq!(report.stats.outside_window, 1);
        assert_eq!(pipeline.source.log_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_invocation_reads_cache() {
        let dir = TempDir::new().unwrap();
        let runs = vec![run(1, 1, 60.0)];
        let first = FakeSource {
            runs: runs.clone(),
            logs: HashMap::from([(1, colcon_bundle(&[("x", 3.0)]))]),
            ..FakeSource::default()
        };
        pipeline(first, &dir)
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        // No logs available remotely any more; the cached bundle must be used.
        let second = FakeSource {
            runs,
            ..FakeSource::default()
        };
        let pipeline = pipeline(second, &dir);
        let report = pipeline
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.stats.cache_hits, 1);
        assert_eq!(report.package_time.get("x"), Some(&[3.0][..]));
        assert_eq!(pipeline.source.log_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_build_log_entry_skips_run() {
        let dir = TempDir::new().unwrap();
        let mut bundle = LogBundle::new();
        bundle.insert("build/1_Set up job.txt", "setup");
        let source = FakeSource {
            runs: vec![run(1, 1, 60.0)],
            logs: HashMap::from([(1, bundle)]),
            ..FakeSource::default()
        };

        let report = pipeline(source, &dir)
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.workflow_time[0].details.is_none());
        assert_eq!(report.stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_listing_fails() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline(FakeSource::default(), &dir)
            .run_at(now(), &cancel)
            .await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_returns_partial_report() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource {
            runs: vec![run(1, 2, 60.0), run(2, 1, 60.0)],
            logs: HashMap::from([(1, colcon_bundle(&[("x", 4.0)]))]),
            hang: HashSet::from([2]),
            ..FakeSource::default()
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let pipeline = pipeline(source, &dir);
        let report = pipeline.run_at(now(), &cancel).await.unwrap();

        assert_eq!(report.workflow_time.len(), 2);
        assert!(report.workflow_time[0].details.is_some());
        assert!(report.workflow_time[1].details.is_none());
        assert_eq!(report.stats.skipped, 1);
        assert!(!pipeline.cache.contains(&cache_key(REPO, 2)));
    }

    fn three_runs_with_logs() -> (Vec<WorkflowRun>, HashMap<u64, LogBundle>) {
        let runs = vec![run(1, 3, 60.0), run(2, 2, 60.0), run(3, 1, 60.0)];
        let logs = [1, 2, 3]
            .into_iter()
            .map(|id| (id, colcon_bundle(&[("pkg", id as f64)])))
            .collect();
        (runs, logs)
    }

    #[tokio::test]
    async fn test_server_error_skips_only_that_run() {
        let dir = TempDir::new().unwrap();
        let (runs, logs) = three_runs_with_logs();
        let source = FakeSource {
            runs,
            logs,
            failing: HashMap::from([(2, 502)]),
            ..FakeSource::default()
        };

        let pipeline = pipeline(source, &dir);
        let report = pipeline
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<u64> = report.workflow_time.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(report.workflow_time[1].details.is_none());
        assert_eq!(report.package_time.get("pkg"), Some(&[1.0, 3.0][..]));
        assert_eq!(report.stats.skipped, 1);
        assert!(!pipeline.cache.contains(&cache_key(REPO, 2)));
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_skips_only_that_run() {
        let dir = TempDir::new().unwrap();
        let (runs, logs) = three_runs_with_logs();
        let source = FakeSource {
            runs,
            logs,
            ..FakeSource::default()
        };

        let pipeline = pipeline(source, &dir);
        std::fs::create_dir(pipeline.cache.entry_path(&cache_key(REPO, 2))).unwrap();
        let report = pipeline
            .run_at(now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.workflow_time.len(), 3);
        assert!(report.workflow_time[1].details.is_none());
        assert_eq!(report.package_time.get("pkg"), Some(&[1.0, 3.0][..]));
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(pipeline.source.log_calls.load(Ordering::SeqCst), 2);
    }
}
