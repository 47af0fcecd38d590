//! Error types for remote fetches and local cache access.
//!
//! Library code returns these typed errors so the pipeline can decide
//! per failure whether to skip a run or abort the batch. Application
//! code (config, output, `main`) wraps them in `anyhow`.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Failures of the on-disk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading, writing or renaming a cache file failed.
    #[error("cache I/O error for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// A value could not be encoded, or a stored entry could not be decoded.
    #[error("cache entry '{key}' could not be (de)serialized: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures talking to the workflow API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced a response (DNS, TLS, timeout, reset).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with an unexpected HTTP status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The API refused the request because the rate limit is exhausted.
    #[error("rate limit exhausted for {url} (resets at {})", display_reset(.reset_at))]
    RateLimited {
        url: String,
        reset_at: Option<DateTime<Utc>>,
    },

    /// The response did not match the expected schema or timestamp format.
    #[error("malformed response from {context}: {reason}")]
    MalformedResponse { context: String, reason: String },

    /// The resource expired or was deleted (logs past their retention window).
    #[error("{0} not found (expired or deleted)")]
    NotFound(String),

    #[error(transparent)]
    CacheIo(#[from] CacheError),

    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse classification used when deciding how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transport,
    MalformedResponse,
    NotFound,
    CacheIo,
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transport => write!(f, "transport"),
            FetchErrorKind::MalformedResponse => write!(f, "malformed response"),
            FetchErrorKind::NotFound => write!(f, "not found"),
            FetchErrorKind::CacheIo => write!(f, "cache I/O"),
            FetchErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FetchError {
    pub fn malformed(context: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::MalformedResponse {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Transport { .. }
            | FetchError::Status { .. }
            | FetchError::RateLimited { .. } => FetchErrorKind::Transport,
            FetchError::MalformedResponse { .. } => FetchErrorKind::MalformedResponse,
            FetchError::NotFound(_) => FetchErrorKind::NotFound,
            FetchError::CacheIo(_) => FetchErrorKind::CacheIo,
            FetchError::Cancelled => FetchErrorKind::Cancelled,
        }
    }

    /// Whether sending the same request again may succeed.
    ///
    /// Only connection-level failures and server-side (5xx) errors qualify;
    /// an exhausted rate limit will not recover within a retry backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn display_reset(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "unknown".to_string(),
    }
}
