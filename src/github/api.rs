//! GitHub Actions REST payloads and their normalization.
//!
//! The raw types mirror the JSON the API returns. Conversion into the
//! crate's models parses timestamps, drops duplicate runs and restores
//! creation order.

use crate::error::FetchError;
use crate::models::{JobInterval, LogBundle, WorkflowRun};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use tracing::warn;

/// Timestamp format used by the Actions API.
pub const API_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A page of a paginated listing.
pub trait Page: DeserializeOwned {
    type Item;

    /// Number of items across all pages.
    fn total_count(&self) -> u64;

    fn into_items(self) -> Vec<Self::Item>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRun {
    pub id: u64,
    pub created_at: String,
    pub updated_at: String,
    pub jobs_url: String,
}

#[derive(Debug, Deserialize)]
pub struct RunsPage {
    pub total_count: u64,
    pub workflow_runs: Vec<RawRun>,
}

impl Page for RunsPage {
    type Item = RawRun;

    fn total_count(&self) -> u64 {
        self.total_count
    }

    fn into_items(self) -> Vec<RawRun> {
        self.workflow_runs
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJob {
    #[serde(default)]
    pub name: String,
    pub started_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobsPage {
    pub total_count: u64,
    pub jobs: Vec<RawJob>,
}

impl Page for JobsPage {
    type Item = RawJob;

    fn total_count(&self) -> u64 {
        self.total_count
    }

    fn into_items(self) -> Vec<RawJob> {
        self.jobs
    }
}

/// Number of pages needed for `total` items at `per_page` items each.
pub fn pages_needed(total: u64, per_page: u32) -> u64 {
    let per_page = u64::from(per_page.max(1));
    total.div_ceil(per_page)
}

/// Parse a timestamp in [`API_TIME_FORMAT`].
pub fn parse_api_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, API_TIME_FORMAT).map(|naive| naive.and_utc())
}

/// Convert raw runs into [`WorkflowRun`]s, oldest first.
///
/// Runs that appear twice (they shift between pages when new runs are
/// created during pagination) keep their first occurrence. The sort is
/// stable, so runs created in the same second keep page order. Durations
/// are left at zero for the caller to fill in.
pub fn normalize_runs(raw_runs: Vec<RawRun>) -> Result<Vec<WorkflowRun>, FetchError> {
    let mut seen = HashSet::new();
    let mut runs = Vec::with_capacity(raw_runs.len());

    for raw in raw_runs {
        if !seen.insert(raw.id) {
            warn!("Dropping duplicate workflow run {}", raw.id);
            continue;
        }

        let context = format!("workflow run {}", raw.id);
        let created_at = parse_api_timestamp(&raw.created_at).map_err(|e| {
            FetchError::malformed(&context, format!("created_at '{}': {}", raw.created_at, e))
        })?;
        let updated_at = parse_api_timestamp(&raw.updated_at).map_err(|e| {
            FetchError::malformed(&context, format!("updated_at '{}': {}", raw.updated_at, e))
        })?;

        runs.push(WorkflowRun {
            id: raw.id,
            created_at,
            updated_at,
            jobs_url: raw.jobs_url,
            duration: 0.0,
        });
    }

    runs.sort_by_key(|run| run.created_at);
    Ok(runs)
}

/// Convert raw jobs into their execution intervals.
pub fn job_intervals(run_id: u64, jobs: &[RawJob]) -> Result<Vec<JobInterval>, FetchError> {
    let context = format!("jobs of run {}", run_id);

    jobs.iter()
        .map(|job| -> Result<JobInterval, FetchError> {
            let completed = job.completed_at.as_deref().ok_or_else(|| {
                FetchError::malformed(&context, format!("job '{}' has no completed_at", job.name))
            })?;
            let started_at = parse_api_timestamp(&job.started_at).map_err(|e| {
                FetchError::malformed(&context, format!("started_at '{}': {}", job.started_at, e))
            })?;
            let completed_at = parse_api_timestamp(completed).map_err(|e| {
                FetchError::malformed(&context, format!("completed_at '{}': {}", completed, e))
            })?;
            Ok(JobInterval {
                started_at,
                completed_at,
            })
        })
        .collect()
}

/// Sum of job execution times. Gaps between jobs are not counted.
pub fn accurate_duration(intervals: &[JobInterval]) -> f64 {
    intervals.iter().map(JobInterval::seconds).sum()
}

/// Unpack a run's log archive into a [`LogBundle`].
///
/// Invalid UTF-8 in a log is replaced rather than rejected.
pub fn decode_log_archive(run_id: u64, bytes: &[u8]) -> Result<LogBundle, FetchError> {
    let context = format!("log archive of run {}", run_id);
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| FetchError::malformed(&context, e))?;

    let mut bundle = LogBundle::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| FetchError::malformed(&context, e))?;
        if entry.is_dir() {
            continue;
        }

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| FetchError::malformed(&context, e))?;
        bundle.insert(entry.name(), String::from_utf8_lossy(&content));
    }

    Ok(bundle)
}
