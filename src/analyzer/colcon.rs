//! Analyzer for colcon console output captured by GitHub Actions.
//!
//! GitHub prefixes every log line with an RFC 3339 timestamp. colcon
//! prints `Starting >>> pkg` when a package begins and
//! `Finished <<< pkg [1min 2.3s]` (or `Failed`/`Aborted`) when it ends.

use super::{GapReason, LogAnalysis, LogAnalyzer, ParseGap};
use crate::models::{seconds_between, PackageDuration};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::trace;

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z) ?(.*)$")
        .expect("timestamp pattern is valid")
});

static START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Starting\s+>>>\s+(\S+)").expect("start pattern is valid"));

static END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Finished|Failed|Aborted)\s+<<<\s+(\S+)(?:\s+\[([^\]]*)\])?")
        .expect("end pattern is valid")
});

static ELAPSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(h|min|s)\b").expect("elapsed pattern is valid")
});

/// Extracts package build times from colcon output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColconLogAnalyzer;

impl ColconLogAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl LogAnalyzer for ColconLogAnalyzer {
    fn analyze(&self, log_text: &str) -> LogAnalysis {
        let mut analysis = LogAnalysis::default();
        let mut origin: Option<DateTime<Utc>> = None;
        // Packages with a start marker and no end marker yet.
        let mut open: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();

        for raw_line in log_text.lines() {
            let (timestamp, body) = split_timestamp(raw_line.trim_start_matches('\u{feff}'));
            if origin.is_none() {
                origin = timestamp;
            }
            let body = body.trim();

            if let Some(caps) = START_RE.captures(body) {
                let package = caps[1].to_string();
                trace!("start marker: {}", package);
                if open.insert(package.clone(), timestamp).is_some() {
                    analysis.gaps.push(ParseGap {
                        package,
                        reason: GapReason::Restarted,
                    });
                }
                continue;
            }

            let Some(caps) = END_RE.captures(body) else {
                continue;
            };
            let package = caps[2].to_string();
            trace!("end marker: {} ({})", package, &caps[1]);

            let Some(started_at) = open.remove(&package) else {
                analysis.gaps.push(ParseGap {
                    package,
                    reason: GapReason::MissingStart,
                });
                continue;
            };

            let reason = match &caps[1] {
                "Failed" => Some(GapReason::Failed),
                "Aborted" => Some(GapReason::Aborted),
                _ => None,
            };
            if let Some(reason) = reason {
                analysis.gaps.push(ParseGap { package, reason });
                continue;
            }

            let logged = caps.get(3).and_then(|m| parse_elapsed(m.as_str()));
            let measured = match (started_at, timestamp) {
                (Some(start), Some(end)) => Some(seconds_between(start, end)),
                _ => None,
            };

            match logged.or(measured) {
                None => analysis.gaps.push(ParseGap {
                    package,
                    reason: GapReason::MissingElapsed,
                }),
                Some(duration) if duration < 0.0 => analysis.gaps.push(ParseGap {
                    package,
                    reason: GapReason::NegativeDuration,
                }),
                Some(duration) => {
                    let start_offset = match (origin, started_at) {
                        (Some(origin), Some(start)) => seconds_between(origin, start).max(0.0),
                        _ => 0.0,
                    };
                    analysis.packages.push(PackageDuration {
                        package_name: package,
                        start_offset,
                        duration,
                    });
                }
            }
        }

        let mut unterminated: Vec<String> = open.into_keys().collect();
        unterminated.sort();
        analysis
            .gaps
            .extend(unterminated.into_iter().map(|package| ParseGap {
                package,
                reason: GapReason::Unterminated,
            }));

        analysis
    }
}

/// Split an optional GitHub timestamp prefix from a log line.
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    let Some(caps) = TIMESTAMP_RE.captures(line) else {
        return (None, line);
    };

    let timestamp = DateTime::parse_from_rfc3339(&caps[1])
        .ok()
        .map(|ts| ts.with_timezone(&Utc));
    let body = caps.get(2).map_or("", |m| m.as_str());
    (timestamp, body)
}

/// Parse colcon's elapsed notation (`2.95s`, `1min 10.0s`, `1h 4min 0.0s`).
///
/// Anything after a comma (`12.3s, exited with code 2`) is ignored.
fn parse_elapsed(text: &str) -> Option<f64> {
    let text = text.split(',').next().unwrap_or("");
    let mut total = None;

    for caps in ELAPSED_RE.captures_iter(text) {
        let value: f64 = caps[1].parse().ok()?;
        let factor = match &caps[2] {
            "h" => 3600.0,
            "min" => 60.0,
            _ => 1.0,
        };
        total = Some(total.unwrap_or(0.0) + value * factor);
    }

    total
}
