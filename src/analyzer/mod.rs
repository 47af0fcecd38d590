//! Build-log analyzers.
//!
//! An analyzer turns the text of one build-step log into package build
//! durations. Extraction is best effort: markers that cannot be paired
//! into a duration are left out of the result and reported as gaps.

pub mod colcon;

pub use colcon::ColconLogAnalyzer;

use crate::models::PackageDuration;
use std::fmt;

/// Why a package's markers did not produce a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    /// A start marker was never followed by an end marker.
    Unterminated,
    /// An end marker had no preceding start marker.
    MissingStart,
    /// The package was started again before it finished.
    Restarted,
    /// The build tool reported the package as failed.
    Failed,
    /// The build tool aborted the package.
    Aborted,
    /// Neither an elapsed value nor timestamps were available.
    MissingElapsed,
    /// The computed duration was negative.
    NegativeDuration,
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GapReason::Unterminated => "start marker without end marker",
            GapReason::MissingStart => "end marker without start marker",
            GapReason::Restarted => "started again before finishing",
            GapReason::Failed => "package failed",
            GapReason::Aborted => "package aborted",
            GapReason::MissingElapsed => "no elapsed time or timestamps",
            GapReason::NegativeDuration => "negative duration",
        };
        write!(f, "{}", text)
    }
}

/// A package whose markers could not be turned into a duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseGap {
    pub package: String,
    pub reason: GapReason,
}

/// Result of analyzing one log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogAnalysis {
    /// One entry per package that completed. Order is not meaningful.
    pub packages: Vec<PackageDuration>,
    pub gaps: Vec<ParseGap>,
}

/// Parser for one build tool's log format.
pub trait LogAnalyzer: Send + Sync {
    /// Extract package durations together with the markers that were skipped.
    fn analyze(&self, log_text: &str) -> LogAnalysis;

    /// Extract package durations, dropping gap information.
    #[allow(dead_code)] // The pipeline uses `analyze` to count gaps
    fn parse(&self, log_text: &str) -> Vec<PackageDuration> {
        self.analyze(log_text).packages
    }
}
