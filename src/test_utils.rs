//! Shared fakes, fixtures and generators for tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeDelta;

use crate::access::MemoryAccessClient;
use crate::approval::{DecisionHandler, HandlerConfig, HandlerRegistry, ReasonTemplate};
use crate::dispatch::{DispatchError, EventSink};
use crate::github::{
    GitHubApi, GitHubApiError, PendingDeployment, ReviewVerdict, WorkflowRun, WorkflowRunInfo,
};
use crate::types::{
    AccessRequest, DeploymentReviewEvent, RepoId, WorkflowDispatchEvent, WorkflowRunId,
};

pub const RUN_ID: WorkflowRunId = WorkflowRunId(14988928371);

// ─── Fixtures ───

pub fn repo() -> RepoId {
    RepoId::new("org", "repo")
}

pub fn deployment_event() -> DeploymentReviewEvent {
    DeploymentReviewEvent::new(repo(), "build/prod", RUN_ID, "alice")
}

pub fn handler_config() -> HandlerConfig {
    HandlerConfig {
        repo: repo(),
        user: "github-approver".to_string(),
        environments: BTreeMap::from([
            ("build/prod".to_string(), "gha-build-prod".to_string()),
            ("build/stage".to_string(), "gha-build-stage".to_string()),
        ]),
        request_ttl: TimeDelta::hours(4),
        reason_template: ReasonTemplate::default(),
    }
}

pub fn registry(
    github: &Arc<FakeGitHub>,
    access: &Arc<MemoryAccessClient>,
) -> HandlerRegistry<FakeGitHub, MemoryAccessClient> {
    HandlerRegistry::new([DecisionHandler::new(
        handler_config(),
        github.clone(),
        access.clone(),
    )])
    .unwrap()
}

/// Polls `check` until it returns true, failing the test after ~2s.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

// ─── Fake GitHub ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedReview {
    pub repo: RepoId,
    pub run: WorkflowRunId,
    pub verdict: ReviewVerdict,
    pub environment: String,
    pub comment: String,
}

#[derive(Default)]
struct FakeGitHubState {
    /// Waiting runs and the environments each still blocks on.
    waiting: BTreeMap<(RepoId, WorkflowRunId), (WorkflowRun, Vec<String>)>,
    reviews: Vec<RecordedReview>,
    failure: Option<u16>,
}

/// In-memory stand-in for the Actions API.
///
/// Reviewing an environment unblocks it; a run with no blocked environments
/// left stops being listed as waiting.
#[derive(Default)]
pub struct FakeGitHub {
    state: Mutex<FakeGitHubState>,
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_waiting_run(&self, repo: RepoId, run: WorkflowRunId, environments: &[&str]) {
        let workflow_run = WorkflowRun {
            id: run,
            name: "Deploy".to_string(),
            repo: repo.clone(),
            requester: "alice".to_string(),
        };
        let environments = environments.iter().map(|e| e.to_string()).collect();
        self.state
            .lock()
            .unwrap()
            .waiting
            .insert((repo, run), (workflow_run, environments));
    }

    pub fn reviews(&self) -> Vec<RecordedReview> {
        self.state.lock().unwrap().reviews.clone()
    }

    /// Makes every call fail with the given HTTP status until cleared.
    pub fn set_failure(&self, status: Option<u16>) {
        self.state.lock().unwrap().failure = status;
    }

    fn check_failure(&self) -> Result<(), GitHubApiError> {
        match self.state.lock().unwrap().failure {
            Some(status) => Err(GitHubApiError::from_status(status, "injected failure")),
            None => Ok(()),
        }
    }
}

impl GitHubApi for FakeGitHub {
    async fn list_waiting_workflow_runs(
        &self,
        repo: &RepoId,
    ) -> Result<Vec<WorkflowRun>, GitHubApiError> {
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .waiting
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|(_, (run, _))| run.clone())
            .collect())
    }

    async fn get_pending_deployments(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
    ) -> Result<Vec<PendingDeployment>, GitHubApiError> {
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .waiting
            .get(&(repo.clone(), run))
            .map(|(_, envs)| {
                envs.iter()
                    .map(|e| PendingDeployment {
                        environment: e.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn review_deployment_protection_rule(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
        verdict: ReviewVerdict,
        environment: &str,
        comment: &str,
    ) -> Result<(), GitHubApiError> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        state.reviews.push(RecordedReview {
            repo: repo.clone(),
            run,
            verdict,
            environment: environment.to_string(),
            comment: comment.to_string(),
        });
        let key = (repo.clone(), run);
        if let Some((_, envs)) = state.waiting.get_mut(&key) {
            envs.retain(|e| e != environment);
            if envs.is_empty() {
                state.waiting.remove(&key);
            }
        }
        Ok(())
    }

    async fn get_workflow_run_info(
        &self,
        repo: &RepoId,
        run: WorkflowRunId,
    ) -> Result<WorkflowRunInfo, GitHubApiError> {
        self.check_failure()?;
        Ok(WorkflowRunInfo {
            name: "Deploy".to_string(),
            url: format!("https://github.com/{repo}/actions/runs/{run}"),
            requester: "alice".to_string(),
        })
    }
}

// ─── Recording Sink ───

/// An `EventSink` that records what it receives.
#[derive(Default)]
pub struct RecordingSink {
    deployments: Mutex<Vec<DeploymentReviewEvent>>,
    reviews: Mutex<Vec<AccessRequest>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deployments(&self) -> Vec<DeploymentReviewEvent> {
        self.deployments.lock().unwrap().clone()
    }

    pub fn reviews(&self) -> Vec<AccessRequest> {
        self.reviews.lock().unwrap().clone()
    }

    /// Makes every entry point fail with `ShuttingDown`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        Ok(())
    }
}

impl EventSink for RecordingSink {
    async fn handle_deployment_review_event_received(
        &self,
        event: DeploymentReviewEvent,
    ) -> Result<(), DispatchError> {
        self.check_open()?;
        self.deployments.lock().unwrap().push(event);
        Ok(())
    }

    async fn handle_workflow_dispatch_event_received(
        &self,
        _event: WorkflowDispatchEvent,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::Unsupported("workflow_dispatch"))
    }

    async fn handle_access_request_reviewed(
        &self,
        request: AccessRequest,
    ) -> Result<(), DispatchError> {
        self.check_open()?;
        self.reviews.lock().unwrap().push(request);
        Ok(())
    }
}
