//! GitHub Actions data acquisition.
//!
//! [`RunSource`] is the seam the aggregation pipeline depends on;
//! [`WorkflowClient`] implements it over the REST API.

pub mod api;
pub mod client;

pub use client::{ClientConfig, WorkflowClient, MAX_PER_PAGE};

use crate::error::FetchError;
use crate::models::{LogBundle, WorkflowRun};
use async_trait::async_trait;

/// Provider of workflow runs and their logs.
#[async_trait]
pub trait RunSource: Send + Sync {
    /// All successful runs, oldest first, with `duration` filled in.
    async fn list_runs(
        &self,
        repo: &str,
        workflow_id: &str,
        accurate: bool,
    ) -> Result<Vec<WorkflowRun>, FetchError>;

    /// The log files of one run.
    async fn get_run_logs(&self, repo: &str, run_id: u64) -> Result<LogBundle, FetchError>;
}

#[async_trait]
impl RunSource for WorkflowClient {
    async fn list_runs(
        &self,
        repo: &str,
        workflow_id: &str,
        accurate: bool,
    ) -> Result<Vec<WorkflowRun>, FetchError> {
        WorkflowClient::list_runs(self, repo, workflow_id, accurate).await
    }

    async fn get_run_logs(&self, repo: &str, run_id: u64) -> Result<LogBundle, FetchError> {
        WorkflowClient::get_run_logs(self, repo, run_id).await
    }
}
