//! Run filtering and report accumulation.
//!
//! This module provides the filters applied to the run list and the
//! [`ReportBuilder`] that merges per-run outcomes into an
//! [`AggregatedReport`].

use crate::cache::CacheStatus;
use crate::config::OutlierPolicy;
use crate::error::{FetchError, FetchErrorKind};
use crate::models::{
    AggregatedReport, PackageDetails, PackageDuration, PackageDurationSeries, PipelineStats,
    WorkflowRun, WorkflowTimeEntry,
};
use chrono::{DateTime, Utc};
use std::fmt;

/// Why a run has no package breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The run is older than the recency window.
    OutsideWindow,
    /// The logs expired or were deleted.
    NotFound,
    Transport(String),
    Malformed(String),
    CacheIo(String),
    /// The archive had no entry for the build-step log.
    MissingBuildLog,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OutsideWindow => write!(f, "outside the recency window"),
            SkipReason::NotFound => write!(f, "logs not found"),
            SkipReason::Transport(msg) => write!(f, "transport error: {}", msg),
            SkipReason::Malformed(msg) => write!(f, "malformed response: {}", msg),
            SkipReason::CacheIo(msg) => write!(f, "cache error: {}", msg),
            SkipReason::MissingBuildLog => write!(f, "build log missing from archive"),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<&FetchError> for SkipReason {
    fn from(error: &FetchError) -> Self {
        match error.kind() {
            FetchErrorKind::NotFound => SkipReason::NotFound,
            FetchErrorKind::Transport => SkipReason::Transport(error.to_string()),
            FetchErrorKind::MalformedResponse => SkipReason::Malformed(error.to_string()),
            FetchErrorKind::CacheIo => SkipReason::CacheIo(error.to_string()),
            FetchErrorKind::Cancelled => SkipReason::Cancelled,
        }
    }
}

/// Terminal state of one run in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Analyzed {
        /// Whether the log bundle came from the cache or was downloaded.
        status: CacheStatus,
        details: PackageDetails,
        /// Package markers that produced no duration.
        gaps: usize,
    },
    Skipped(SkipReason),
}

/// Accumulates per-run outcomes into a report.
///
/// Runs must be recorded in run order; the series keep that order.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    workflow_time: Vec<WorkflowTimeEntry>,
    package_time: PackageDurationSeries,
    stats: PipelineStats,
}

impl ReportBuilder {
    pub fn new(runs_listed: usize, outliers_dropped: usize) -> Self {
        Self {
            stats: PipelineStats {
                runs_listed,
                outliers_dropped,
                ..PipelineStats::default()
            },
            ..Self::default()
        }
    }

    /// Add one run. Skipped runs still get a `workflow_time` entry.
    pub fn record(&mut self, run: &WorkflowRun, outcome: RunOutcome) {
        let details = match outcome {
            RunOutcome::Analyzed {
                status,
                details,
                gaps,
            } => {
                match status {
                    CacheStatus::Hit => self.stats.cache_hits += 1,
                    CacheStatus::Miss => self.stats.fetched += 1,
                }
                self.stats.parse_gaps += gaps;
                for (package, duration) in details.iter() {
                    self.package_time.push(package, duration);
                }
                Some(details)
            }
            RunOutcome::Skipped(SkipReason::OutsideWindow) => {
                self.stats.outside_window += 1;
                None
            }
            RunOutcome::Skipped(_) => {
                self.stats.skipped += 1;
                None
            }
        };

        self.workflow_time.push(WorkflowTimeEntry {
            run_id: run.id,
            date: run.created_at,
            duration: run.duration,
            details,
        });
    }

    pub fn finish(self) -> AggregatedReport {
        AggregatedReport {
            workflow_time: self.workflow_time,
            package_time: self.package_time,
            stats: self.stats,
        }
    }
}

/// Sort package durations slowest first and reduce them to one value per
/// package. A repeated package keeps its first position and its last value.
pub fn summarize_packages(mut packages: Vec<PackageDuration>) -> PackageDetails {
    packages.sort_by(|a, b| {
        b.duration
            .partial_cmp(&a.duration)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut details = PackageDetails::default();
    for package in &packages {
        details.set(&package.package_name, package.duration);
    }
    details
}

/// Drop runs longer than `ceiling` seconds when `policy` applies.
///
/// A run lasting exactly `ceiling` is kept. Returns the kept runs and the
/// number dropped.
pub fn apply_outlier_filter(
    runs: Vec<WorkflowRun>,
    ceiling: f64,
    policy: OutlierPolicy,
    accurate: bool,
) -> (Vec<WorkflowRun>, usize) {
    if !policy.applies(accurate) {
        return (runs, 0);
    }

    let before = runs.len();
    let kept: Vec<WorkflowRun> = runs
        .into_iter()
        .filter(|run| run.duration <= ceiling)
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Whether a run is young enough to have its logs analyzed.
///
/// Age is counted in whole days, truncated.
pub fn is_recent(run: &WorkflowRun, now: DateTime<Utc>, window_days: i64) -> bool {
    (now - run.created_at).num_days() <= window_days
}

/// The `n` slowest packages of one run.
pub fn slowest_packages(details: &PackageDetails, n: usize) -> Vec<(&str, f64)> {
    let mut packages: Vec<(&str, f64)> = details.iter().collect();
    packages.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    packages.truncate(n);
    packages
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn run_with_duration(id: u64, duration: f64) -> WorkflowRun {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        WorkflowRun {
            id,
            created_at,
            updated_at: created_at,
            jobs_url: String::new(),
            duration,
        }
    }

    fn package(name: &str, duration: f64) -> PackageDuration {
        PackageDuration {
            package_name: name.to_string(),
            start_offset: 0.0,
            duration,
        }
    }

    fn details(entries: &[(&str, f64)]) -> PackageDetails {
        let mut details = PackageDetails::default();
        for (name, duration) in entries {
            details.set(name, *duration);
        }
        details
    }

    #[test]
    fn test_summarize_sorts_slowest_first() {
        let summary = summarize_packages(vec![
            package("fast", 1.0),
            package("slow", 30.0),
            package("medium", 7.5),
        ]);

        let names: Vec<&str> = summary.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["slow", "medium", "fast"]);
    }

    #[test]
    fn test_summarize_repeated_package_last_value_wins() {
        let summary = summarize_packages(vec![package("a", 5.0), package("a", 2.0)]);

        assert_eq!(summary.len(), 1);
        assert_eq!(summary.get("a"), Some(2.0));
    }

    #[test]
    fn test_outlier_boundary() {
        let ceiling = 100.0 * 3600.0;
        let runs = vec![
            run_with_duration(1, ceiling),
            run_with_duration(2, ceiling + 1.0),
            run_with_duration(3, 60.0),
        ];

        let (kept, dropped) = apply_outlier_filter(runs, ceiling, OutlierPolicy::Always, false);
        let ids: Vec<u64> = kept.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_outlier_policy_fast_only_keeps_accurate_runs() {
        let runs = vec![run_with_duration(1, 1e9)];

        let (kept, dropped) = apply_outlier_filter(runs.clone(), 10.0, OutlierPolicy::FastOnly, true);
        assert_eq!((kept.len(), dropped), (1, 0));

        let (kept, dropped) = apply_outlier_filter(runs, 10.0, OutlierPolicy::FastOnly, false);
        assert_eq!((kept.len(), dropped), (0, 1));
    }

    #[test]
    fn test_is_recent_counts_whole_days() {
        let run = run_with_duration(1, 0.0);

        let now = run.created_at + Duration::days(90) + Duration::hours(23);
        assert!(is_recent(&run, now, 90));

        let now = run.created_at + Duration::days(91);
        assert!(!is_recent(&run, now, 90));
    }

    #[test]
    fn test_builder_merges_in_run_order() {
        let mut builder = ReportBuilder::new(3, 0);
        builder.record(
            &run_with_duration(1, 100.0),
            RunOutcome::Analyzed {
                status: CacheStatus::Miss,
                details: details(&[("x", 10.0), ("y", 5.0)]),
                gaps: 1,
            },
        );
        builder.record(
            &run_with_duration(2, 200.0),
            RunOutcome::Skipped(SkipReason::NotFound),
        );
        builder.record(
            &run_with_duration(3, 300.0),
            RunOutcome::Analyzed {
                status: CacheStatus::Hit,
                details: details(&[("x", 12.0)]),
                gaps: 0,
            },
        );

        let report = builder.finish();
        let ids: Vec<u64> = report.workflow_time.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(report.workflow_time[1].details.is_none());
        assert_eq!(report.package_time.get("x"), Some(&[10.0, 12.0][..]));
        assert_eq!(report.package_time.get("y"), Some(&[5.0][..]));

        assert_eq!(report.stats.fetched, 1);
        assert_eq!(report.stats.cache_hits, 1);
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(report.stats.parse_gaps, 1);
    }

    #[test]
    fn test_outside_window_is_not_counted_as_skipped() {
        let mut builder = ReportBuilder::new(1, 0);
        builder.record(
            &run_with_duration(1, 100.0),
            RunOutcome::Skipped(SkipReason::OutsideWindow),
        );

        let report = builder.finish();
        assert_eq!(report.stats.outside_window, 1);
        assert_eq!(report.stats.skipped, 0);
        assert_eq!(report.workflow_time.len(), 1);
    }

    #[test]
    fn test_skip_reason_from_fetch_error() {
        let reason = SkipReason::from(&FetchError::NotFound("logs".to_string()));
        assert_eq!(reason, SkipReason::NotFound);

        let reason = SkipReason::from(&FetchError::Cancelled);
        assert_eq!(reason, SkipReason::Cancelled);

        let reason = SkipReason::from(&FetchError::Status {
            url: "u".to_string(),
            status: 502,
        });
        assert!(matches!(reason, SkipReason::Transport(_)));
    }

    #[test]
    fn test_slowest_packages() {
        let summary = details(&[("a", 1.0), ("b", 9.0), ("c", 4.0)]);
        let top = slowest_packages(&summary, 2);
        assert_eq!(top, vec![("b", 9.0), ("c", 4.0)]);
    }
}
