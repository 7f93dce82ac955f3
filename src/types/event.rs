//! CI-side events that can trigger an access request.

use serde::{Deserialize, Serialize};

use super::ids::{RepoId, WorkflowRunId};

/// A workflow run is blocked on a deployment protection rule for an environment.
///
/// Produced by the webhook adapter for `deployment_protection_rule.requested`
/// deliveries, and synthesized by the reconciler for waiting runs it finds
/// without a matching access request. Events are never persisted: they are
/// either processed or dropped, and the reconciler recovers anything lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentReviewEvent {
    /// The repository the workflow runs in.
    pub repo: RepoId,
    /// The environment the job is waiting on (e.g. `build/prod`).
    pub environment: String,
    /// The blocked workflow run.
    pub workflow_run_id: WorkflowRunId,
    /// GitHub login of the user who triggered the run.
    pub requester: String,
}

impl DeploymentReviewEvent {
    pub fn new(
        repo: RepoId,
        environment: impl Into<String>,
        workflow_run_id: WorkflowRunId,
        requester: impl Into<String>,
    ) -> Self {
        DeploymentReviewEvent {
            repo,
            environment: environment.into(),
            workflow_run_id,
            requester: requester.into(),
        }
    }
}

/// A `workflow_dispatch` delivery.
///
/// Accepted by the webhook adapter so the event is recognised, but there is no
/// approval flow attached to manual dispatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDispatchEvent {
    pub repo: RepoId,
    /// Path of the workflow file, e.g. `.github/workflows/deploy.yml`.
    pub workflow: String,
    /// The git ref the workflow was dispatched on.
    pub git_ref: String,
    pub requester: String,
}
