//! CSV and JSON dataset generation.
//!
//! This module renders an [`AggregatedReport`] into the two files
//! consumed by the build-time dashboards.

use crate::models::{AggregatedReport, PackageDetails, PackageDurationSeries};
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Header row of the CSV dataset.
pub const CSV_HEADER: &str = "Date,Duration (hours)";

/// Date format of the CSV dataset.
pub const CSV_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date format of the JSON dataset.
pub const JSON_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Serialize)]
struct JsonDocument<'a> {
    workflow_time: Vec<JsonWorkflowTime<'a>>,
    package_time: &'a PackageDurationSeries,
}

#[derive(Serialize)]
struct JsonWorkflowTime<'a> {
    run_id: u64,
    date: String,
    /// Hours.
    duration: f64,
    details: Option<&'a PackageDetails>,
}

fn hours(seconds: f64) -> f64 {
    seconds / 3600.0
}

/// Generate the CSV dataset: one row per reported run, oldest first.
pub fn generate_csv_report(report: &AggregatedReport) -> String {
    let mut output = String::new();

    output.push_str(CSV_HEADER);
    output.push_str("\r\n");

    for entry in &report.workflow_time {
        output.push_str(&format!(
            "{},{}\r\n",
            entry.date.format(CSV_DATE_FORMAT),
            hours(entry.duration)
        ));
    }

    output
}

/// Generate the JSON dataset.
///
/// Run durations are in hours, package durations in seconds. Runs
/// without a package breakdown carry `"details": null`.
pub fn generate_json_report(report: &AggregatedReport) -> Result<String> {
    let document = JsonDocument {
        workflow_time: report
            .workflow_time
            .iter()
            .map(|entry| JsonWorkflowTime {
                run_id: entry.run_id,
                date: entry.date.format(JSON_DATE_FORMAT).to_string(),
                duration: hours(entry.duration),
                details: entry.details.as_ref(),
            })
            .collect(),
        package_time: &report.package_time,
    };

    serde_json::to_string_pretty(&document).map_err(Into::into)
}

/// Write the CSV dataset to a file.
pub fn write_csv_report(report: &AggregatedReport, path: &Path) -> Result<()> {
    write_file(path, &generate_csv_report(report))
}

/// Write the JSON dataset to a file.
pub fn write_json_report(report: &AggregatedReport, path: &Path) -> Result<()> {
    let content = generate_json_report(report)?;
    write_file(path, &content)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(())
}
