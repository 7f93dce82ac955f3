//! The CI-side operations the service depends on.
//!
//! The trait is the seam between the decision logic and GitHub: production
//! uses [`GitHubClient`](super::GitHubClient), tests use a recording fake.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::types::{RepoId, WorkflowRunId};

use super::error::GitHubApiError;

/// A workflow run in the `waiting` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub name: String,
    pub repo: RepoId,
    /// Login of the user who triggered the run.
    pub requester: String,
}

/// One environment a waiting run is blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeployment {
    pub environment: String,
}

/// Descriptive data used to build an access request's reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunInfo {
    pub name: String,
    /// Browser URL of the run.
    pub url: String,
    pub requester: String,
}

/// The verdict posted back to a deployment protection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewVerdict {
    Approved,
    Rejected,
}

impl ReviewVerdict {
    /// The `state` value the REST API expects.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            ReviewVerdict::Approved => "approved",
            ReviewVerdict::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

/// CI operations used by the decision handlers and the reconciler.
pub trait GitHubApi: Send + Sync + 'static {
    /// Lists workflow runs currently blocked on a protection rule.
    fn list_waiting_workflow_runs(
        &self,
        repo: &RepoId,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, GitHubApiError>> + Send;

    /// Lists the environments a run is waiting on.
    fn get_pending_deployments(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
    ) -> impl Future<Output = Result<Vec<PendingDeployment>, GitHubApiError>> + Send;

    /// Approves or rejects a custom deployment protection rule.
    fn review_deployment_protection_rule(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
        verdict: ReviewVerdict,
        environment: &str,
        comment: &str,
    ) -> impl Future<Output = Result<(), GitHubApiError>> + Send;

    fn get_workflow_run_info(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
    ) -> impl Future<Output = Result<WorkflowRunInfo, GitHubApiError>> + Send;
}
