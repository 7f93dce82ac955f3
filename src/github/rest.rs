//! `GitHubApi` over the GitHub REST API.
//!
//! Endpoints:
//! - `GET  /repos/{o}/{r}/actions/runs?status=waiting`
//! - `GET  /repos/{o}/{r}/actions/runs/{id}/pending_deployments`
//! - `GET  /repos/{o}/{r}/actions/runs/{id}`
//! - `POST /repos/{o}/{r}/actions/runs/{id}/deployment_protection_rule`
//!
//! Each call makes exactly one request. A failure goes back to the caller,
//! which abandons the event; the reconciler's next pass tries again. The
//! review POST is not idempotent, so it must never be resent blindly.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::types::{RepoId, WorkflowRunId};

use super::api::{GitHubApi, PendingDeployment, ReviewVerdict, WorkflowRun, WorkflowRunInfo};
use super::client::GitHubClient;
use super::error::GitHubApiError;

const PER_PAGE: u32 = 100;

/// Upper bound on pages fetched when listing waiting runs.
const MAX_PAGES: u32 = 10;

// ─── Response Types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WorkflowRunsPage {
    #[serde(default)]
    workflow_runs: Vec<RunResponse>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    actor: Option<Actor>,
    #[serde(default)]
    triggering_actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PendingDeploymentResponse {
    environment: EnvironmentRef,
}

#[derive(Debug, Deserialize)]
struct EnvironmentRef {
    name: String,
}

#[derive(Debug, Serialize)]
struct ListRunsQuery {
    status: &'static str,
    per_page: u32,
    page: u32,
}

#[derive(Debug, Serialize)]
struct ProtectionRuleReview<'a> {
    environment_name: &'a str,
    state: &'static str,
    comment: &'a str,
}

impl RunResponse {
    /// The user who triggered the run; re-runs report the re-runner.
    fn requester(&self) -> String {
        self.triggering_actor
            .as_ref()
            .or(self.actor.as_ref())
            .map(|a| a.login.clone())
            .unwrap_or_default()
    }

    fn into_workflow_run(self, repo: &RepoId) -> WorkflowRun {
        let requester = self.requester();
        WorkflowRun {
            id: WorkflowRunId(self.id),
            name: self.name.unwrap_or_default(),
            repo: repo.clone(),
            requester,
        }
    }

    fn into_info(self) -> WorkflowRunInfo {
        let requester = self.requester();
        WorkflowRunInfo {
            name: self.name.unwrap_or_default(),
            url: self.html_url,
            requester,
        }
    }
}

fn runs_url(repo: &RepoId) -> String {
    format!(
        "/repos/{}/{}/actions/runs",
        repo.organization, repo.repository
    )
}

fn run_url(repo: &RepoId, run: WorkflowRunId) -> String {
    format!("{}/{}", runs_url(repo), run)
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl GitHubApi for GitHubClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn list_waiting_workflow_runs(
        &self,
        repo: &RepoId,
    ) -> Result<Vec<WorkflowRun>, GitHubApiError> {
        let url = runs_url(repo);
        let mut runs = Vec::new();

        for page in 1..=MAX_PAGES {
            let query = ListRunsQuery {
                status: "waiting",
                per_page: PER_PAGE,
                page,
            };
            let batch: WorkflowRunsPage = self
                .inner()
                .get(&url, Some(&query))
                .await
                .map_err(GitHubApiError::from_octocrab)?;

            let is_last_page = batch.workflow_runs.len() < PER_PAGE as usize;
            runs.extend(
                batch
                    .workflow_runs
                    .into_iter()
                    .map(|r| r.into_workflow_run(repo)),
            );
            if is_last_page {
                return Ok(runs);
            }
        }

        tracing::warn!(
            max_pages = MAX_PAGES,
            fetched = runs.len(),
            "waiting run listing truncated at page cap"
        );
        Ok(runs)
    }

    #[instrument(skip(self), fields(repo = %repo, run_id = %run))]
    async fn get_pending_deployments(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
    ) -> Result<Vec<PendingDeployment>, GitHubApiError> {
        let url = format!("{}/pending_deployments", run_url(repo, run));
        let pending: Vec<PendingDeploymentResponse> = self
            .inner()
            .get(&url, None::<&()>)
            .await
            .map_err(GitHubApiError::from_octocrab)?;

        Ok(pending
            .into_iter()
            .map(|p| PendingDeployment {
                environment: p.environment.name,
            })
            .collect())
    }

    #[instrument(skip(self, comment), fields(repo = %repo, run_id = %run, %verdict))]
    async fn review_deployment_protection_rule(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
        verdict: ReviewVerdict,
        environment: &str,
        comment: &str,
    ) -> Result<(), GitHubApiError> {
        let url = format!("{}/deployment_protection_rule", run_url(repo, run));
        let body = ProtectionRuleReview {
            environment_name: environment,
            state: verdict.as_api_str(),
            comment,
        };

        // The endpoint answers 204 No Content, so use the raw request path
        // rather than a typed (deserializing) post.
        let response = self
            .inner()
            ._post(url.as_str(), Some(&body))
            .await
            .map_err(GitHubApiError::from_octocrab)?;
        octocrab::map_github_error(response)
            .await
            .map(drop)
            .map_err(GitHubApiError::from_octocrab)
    }

    #[instrument(skip(self), fields(repo = %repo, run_id = %run))]
    async fn get_workflow_run_info(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
    ) -> Result<WorkflowRunInfo, GitHubApiError> {
        let url = run_url(repo, run);
        let response: RunResponse = self
            .inner()
            .get(&url, None::<&()>)
            .await
            .map_err(GitHubApiError::from_octocrab)?;

        Ok(response.into_info())
    }
}
