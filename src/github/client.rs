//! HTTP client for the GitHub Actions REST API.
//!
//! Pages are fetched one after another. Transport failures and 5xx
//! responses are retried with a linear backoff; everything else is
//! returned to the caller immediately.

use crate::error::FetchError;
use crate::github::api::{
    accurate_duration, decode_log_archive, job_intervals, normalize_runs, pages_needed, JobsPage,
    Page, RunsPage,
};
use crate::models::{LogBundle, WorkflowRun};
use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest page size the Actions API honors.
pub const MAX_PER_PAGE: u32 = 100;

/// Connection settings for [`WorkflowClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    pub api_url: String,
    /// Bearer token sent with every request.
    pub token: String,
    /// Items per page for paginated listings, at most [`MAX_PER_PAGE`].
    pub per_page: u32,
    pub timeout_seconds: u64,
    /// Extra attempts after a retryable failure.
    pub retries: usize,
    /// Delay before the first retry; later retries back off exponentially.
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: String::new(),
            per_page: 100,
            timeout_seconds: 300,
            retries: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Client for workflow-run listings and run logs.
pub struct WorkflowClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl WorkflowClient {
    pub fn new(mut config: ClientConfig) -> anyhow::Result<Self> {
        let per_page = config.per_page.clamp(1, MAX_PER_PAGE);
        if per_page != config.per_page {
            warn!(
                "per_page {} is outside 1..={}, using {}",
                config.per_page, MAX_PER_PAGE, per_page
            );
            config.per_page = per_page;
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("GitHub token contains characters not allowed in a header")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));

        let http = reqwest::Client::builder()
            .user_agent(concat!("buildtrend/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, http })
    }

    fn api_url(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    /// List all successful runs of a workflow, oldest first, with durations.
    ///
    /// With `accurate` the duration is the sum of the run's job times, which
    /// costs one extra request per run. Otherwise it is the wall-clock time
    /// between creation and last update, queue time included.
    pub async fn list_runs(
        &self,
        repo: &str,
        workflow_id: &str,
        accurate: bool,
    ) -> Result<Vec<WorkflowRun>, FetchError> {
        let url = format!(
            "{}/repos/{}/actions/workflows/{}/runs",
            self.api_url(),
            repo,
            workflow_id
        );
        info!("Listing successful runs of {} in {}", workflow_id, repo);

        let raw_runs = self
            .fetch_all_pages::<RunsPage>(&url, &[("status", "success")])
            .await?;
        let mut runs = normalize_runs(raw_runs)?;
        info!("Fetched {} workflow runs", runs.len());

        if accurate {
            info!("Summing job durations for {} runs", runs.len());
            for run in &mut runs {
                run.duration = self.accurate_run_duration(run).await?;
            }
        } else {
            for run in &mut runs {
                run.duration = run.wall_clock_seconds();
            }
        }

        Ok(runs)
    }

    /// Download and unpack the log archive of one run.
    ///
    /// Fails with [`FetchError::NotFound`] once the logs have expired.
    pub async fn get_run_logs(&self, repo: &str, run_id: u64) -> Result<LogBundle, FetchError> {
        let url = format!(
            "{}/repos/{}/actions/runs/{}/logs",
            self.api_url(),
            repo,
            run_id
        );

        let response = self.send(&url, &[]).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;
        debug!("Downloaded {} bytes of logs for run {}", bytes.len(), run_id);

        let bundle = decode_log_archive(run_id, &bytes)?;
        if bundle.is_empty() {
            warn!("Log archive of run {} is empty", run_id);
        }
        debug!("Run {}: {} log files", run_id, bundle.len());
        Ok(bundle)
    }

    async fn accurate_run_duration(&self, run: &WorkflowRun) -> Result<f64, FetchError> {
        let jobs = self.fetch_all_pages::<JobsPage>(&run.jobs_url, &[]).await?;
        let intervals = job_intervals(run.id, &jobs)?;
        debug!("Run {}: {} jobs", run.id, intervals.len());
        Ok(accurate_duration(&intervals))
    }

    /// Fetch page 1, derive the page count from its `total_count`, then
    /// fetch the remaining pages in order.
    async fn fetch_all_pages<P: Page>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<P::Item>, FetchError> {
        let first: P = self.get_json(url, &self.page_query(params, 1)).await?;
        let pages = pages_needed(first.total_count(), self.config.per_page);
        debug!(
            "{}: {} items in {} pages",
            url,
            first.total_count(),
            pages
        );

        let mut items = first.into_items();
        for page in 2..=pages {
            let next: P = self.get_json(url, &self.page_query(params, page)).await?;
            items.extend(next.into_items());
        }

        Ok(items)
    }

    fn page_query(&self, params: &[(&str, &str)], page: u64) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        query.push(("per_page".to_string(), self.config.per_page.to_string()));
        query.push(("page".to_string(), page.to_string()));
        query
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        let response = self.send(url, query).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        serde_json::from_slice(&bytes).map_err(|e| FetchError::malformed(url, e))
    }

    async fn send(&self, url: &str, query: &[(String, String)]) -> Result<Response, FetchError> {
        (|| self.send_once(url, query))
            .retry(self.backoff())
            .when(FetchError::is_retryable)
            .notify(|e: &FetchError, delay: Duration| {
                warn!("{} (retrying in {:?})", e, delay);
            })
            .await
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.retry_backoff)
            .with_max_times(self.config.retries)
            .with_jitter()
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Response, FetchError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let remaining: Option<u64> = header_value(&response, "x-ratelimit-remaining");
        if let Some(remaining) = remaining {
            debug!("Rate limit remaining: {}", remaining);
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(FetchError::NotFound(url.to_string())),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS if remaining == Some(0) => {
                let reset_at = header_value::<i64>(&response, "x-ratelimit-reset")
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
                Err(FetchError::RateLimited {
                    url: url.to_string(),
                    reset_at,
                })
            }
            _ => Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

fn header_value<T: FromStr>(response: &Response, name: &str) -> Option<T> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
