//! Data models for build-time collection.
//!
//! This module contains the core data structures shared by the
//! workflow client, the log analyzer and the aggregation pipeline.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// One successful execution of the monitored workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier, unique within a repository and workflow.
    pub id: u64,
    /// When the run was created (queued).
    pub created_at: DateTime<Utc>,
    /// When the run was last updated (normally its completion).
    pub updated_at: DateTime<Utc>,
    /// API URL listing the jobs of this run.
    pub jobs_url: String,
    /// Run duration in seconds, filled in by the workflow client.
    pub duration: f64,
}

impl WorkflowRun {
    /// Wall-clock seconds between creation and last update.
    ///
    /// Includes queue time, so it is an upper bound of the real build time.
    pub fn wall_clock_seconds(&self) -> f64 {
        seconds_between(self.created_at, self.updated_at)
    }
}

/// Active execution interval of one job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobInterval {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl JobInterval {
    pub fn seconds(&self) -> f64 {
        seconds_between(self.started_at, self.completed_at)
    }
}

/// Log files of one run, keyed by their path inside the log archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogBundle(BTreeMap<String, String>);

impl LogBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, text: impl Into<String>) {
        self.0.insert(path.into(), text.into());
    }

    /// Text of the log stored under `path`, if the archive contained it.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for LogBundle {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Build time of one package within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDuration {
    /// Name of the package as printed by the build tool.
    pub package_name: String,
    /// Seconds from the start of the log to the package's start marker.
    pub start_offset: f64,
    /// Build time in seconds (never negative).
    pub duration: f64,
}

/// Per-run package durations, ordered slowest first.
///
/// Serializes as a JSON object whose keys keep that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageDetails(Vec<(String, f64)>);

impl PackageDetails {
    /// Set the duration of `package`. A repeated name keeps its position
    /// and takes the latest value.
    pub fn set(&mut self, package: &str, duration: f64) {
        match self.0.iter_mut().find(|(name, _)| name == package) {
            Some(entry) => entry.1 = duration,
            None => self.0.push((package.to_string(), duration)),
        }
    }

    #[allow(dead_code)] // Lookup utility
    pub fn get(&self, package: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|(name, _)| name == package)
            .map(|(_, duration)| *duration)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, duration)| (name.as_str(), *duration))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for PackageDetails {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, duration) in &self.0 {
            map.serialize_entry(name, duration)?;
        }
        map.end()
    }
}

/// Duration observations per package, oldest run first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PackageDurationSeries(BTreeMap<String, Vec<f64>>);

impl PackageDurationSeries {
    pub fn push(&mut self, package: &str, duration: f64) {
        self.0.entry(package.to_string()).or_default().push(duration);
    }

    #[allow(dead_code)] // Lookup utility
    pub fn get(&self, package: &str) -> Option<&[f64]> {
        self.0.get(package).map(Vec::as_slice)
    }

    /// Number of distinct packages.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One point of the workflow-duration series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowTimeEntry {
    pub run_id: u64,
    pub date: DateTime<Utc>,
    /// Run duration in seconds.
    pub duration: f64,
    /// Package breakdown, absent when the run's log was not analyzed.
    pub details: Option<PackageDetails>,
}

/// Counters describing one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Runs returned by the listing.
    pub runs_listed: usize,
    /// Runs dropped by the outlier ceiling.
    pub outliers_dropped: usize,
    /// Runs too old for log analysis.
    pub outside_window: usize,
    /// Runs whose log bundle came from the cache.
    pub cache_hits: usize,
    /// Runs whose log bundle was downloaded.
    pub fetched: usize,
    /// Eligible runs whose log could not be obtained or analyzed.
    pub skipped: usize,
    /// Package markers that could not be turned into a duration.
    pub parse_gaps: usize,
}

impl PipelineStats {
    /// Runs that contributed a package breakdown.
    pub fn analyzed(&self) -> usize {
        self.cache_hits + self.fetched
    }
}

/// Final output of one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedReport {
    /// One entry per reported run, oldest first.
    pub workflow_time: Vec<WorkflowTimeEntry>,
    /// Package build-time series across all analyzed runs.
    pub package_time: PackageDurationSeries,
    #[serde(skip)]
    pub stats: PipelineStats,
}

impl AggregatedReport {
    /// The most recent run that has a package breakdown.
    pub fn latest_details(&self) -> Option<(&WorkflowTimeEntry, &PackageDetails)> {
        self.workflow_time
            .iter()
            .rev()
            .find_map(|entry| entry.details.as_ref().map(|details| (entry, details)))
    }
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_wall_clock_seconds() {
        let run = WorkflowRun {
            id: 1,
            created_at: at(0),
            updated_at: at(45),
            jobs_url: String::new(),
            duration: 0.0,
        };
        assert_eq!(run.wall_clock_seconds(), 45.0);
    }

    #[test]
    fn test_job_interval_seconds() {
        let job = JobInterval {
            started_at: at(20),
            completed_at: at(25),
        };
        assert_eq!(job.seconds(), 5.0);
    }

    #[test]
    fn test_package_details_last_write_wins() {
        let mut details = PackageDetails::default();
        details.set("a", 3.0);
        details.set("b", 2.0);
        details.set("a", 1.0);

        assert_eq!(details.len(), 2);
        assert_eq!(details.get("a"), Some(1.0));
        let names: Vec<&str> = details.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_package_details_serializes_in_order() {
        let mut details = PackageDetails::default();
        details.set("zeta", 9.0);
        details.set("alpha", 1.5);

        let json = serde_json::to_string(&details).unwrap();
        assert_eq!(json, r#"{"zeta":9.0,"alpha":1.5}"#);
    }

    #[test]
    fn test_series_push_keeps_order() {
        let mut series = PackageDurationSeries::default();
        series.push("x", 10.0);
        series.push("y", 5.0);
        series.push("x", 12.0);

        assert_eq!(series.get("x"), Some(&[10.0, 12.0][..]));
        assert_eq!(series.get("y"), Some(&[5.0][..]));
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_log_bundle_roundtrips_as_plain_map() {
        let mut bundle = LogBundle::new();
        bundle.insert("build/9_Build.txt", "hello");

        let json = serde_json::to_string(&bundle).unwrap();
        assert_eq!(json, r#"{"build/9_Build.txt":"hello"}"#);
        let back: LogBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("build/9_Build.txt"), Some("hello"));
    }
}
