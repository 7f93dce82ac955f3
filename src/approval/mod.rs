//! Per-repository decision handlers.
//!
//! A [`DecisionHandler`] owns the approval logic for one `organization/repository`:
//! given a CI event it finds or creates the matching access request, and given
//! a decided access request it posts the verdict back to the blocked workflow
//! run. Handlers depend only on the [`GitHubApi`] and [`AccessClient`] traits.
//!
//! Handlers are collected into an immutable [`HandlerRegistry`] at startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::access::{AccessClient, AccessError, AccessRequestFilter};
use crate::github::{GitHubApi, GitHubApiError, ReviewVerdict};
use crate::types::{
    AccessRequest, AccessRequestState, CorrelationLabels, DeploymentReviewEvent, LabelError,
    RepoId,
};

pub mod reason;

pub use reason::{DEFAULT_REASON_TEMPLATE, ReasonContext, ReasonTemplate, TemplateError};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("environment {environment:?} is not configured for {repo}")]
    UnknownEnvironment { repo: RepoId, environment: String },

    /// The guardrail refused the event or decision. Only ever results in a denial.
    #[error("automatically denied: {0}")]
    AutomaticallyDenied(String),

    #[error("access request {0} has not been decided")]
    NotDecided(String),

    #[error("duplicate decision handler for {0}")]
    DuplicateRepository(RepoId),

    #[error("correlation labels: {0}")]
    Labels(#[from] LabelError),

    #[error(transparent)]
    GitHub(#[from] GitHubApiError),

    #[error(transparent)]
    Access(#[from] AccessError),
}

impl HandlerError {
    /// True for errors caused by configuration gaps rather than upstream
    /// failures. These are not worth retrying.
    pub fn is_configuration_gap(&self) -> bool {
        matches!(
            self,
            HandlerError::UnknownEnvironment { .. }
                | HandlerError::AutomaticallyDenied(_)
                | HandlerError::DuplicateRepository(_)
        )
    }

    /// True for upstream failures that a later attempt may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            HandlerError::GitHub(e) => e.kind.is_retriable(),
            HandlerError::Access(e) => matches!(e, AccessError::Unavailable(_)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HandlerError>;

/// Static configuration of one repository's handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub repo: RepoId,
    /// User the access requests are filed as.
    pub user: String,
    /// Environment name to the role requested for it.
    pub environments: BTreeMap<String, String>,
    /// Lifetime of created access requests.
    pub request_ttl: TimeDelta,
    pub reason_template: ReasonTemplate,
}

/// Approval logic for one repository.
pub struct DecisionHandler<G, A> {
    config: HandlerConfig,
    github: Arc<G>,
    access: Arc<A>,
}

impl<G: GitHubApi, A: AccessClient> DecisionHandler<G, A> {
    pub fn new(config: HandlerConfig, github: Arc<G>, access: Arc<A>) -> Self {
        DecisionHandler {
            config,
            github,
            access,
        }
    }

    pub fn repo(&self) -> &RepoId {
        &self.config.repo
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// The role to request for `environment`.
    pub fn role_for_environment(&self, environment: &str) -> Result<&str> {
        self.config
            .environments
            .get(environment)
            .map(String::as_str)
            .ok_or_else(|| HandlerError::UnknownEnvironment {
                repo: self.config.repo.clone(),
                environment: environment.to_string(),
            })
    }

    /// Guardrail: re-checks that `labels` name this handler's repository and a
    /// configured environment.
    pub fn automatically_denied(&self, labels: &CorrelationLabels) -> Result<()> {
        if labels.repo.organization != self.config.repo.organization {
            return Err(HandlerError::AutomaticallyDenied(format!(
                "organization {:?} does not match {:?}",
                labels.repo.organization, self.config.repo.organization
            )));
        }
        if labels.repo.repository != self.config.repo.repository {
            return Err(HandlerError::AutomaticallyDenied(format!(
                "repository {:?} does not match {:?}",
                labels.repo.repository, self.config.repo.repository
            )));
        }
        if !self.config.environments.contains_key(&labels.environment) {
            return Err(HandlerError::AutomaticallyDenied(format!(
                "environment {:?} is not configured",
                labels.environment
            )));
        }
        Ok(())
    }

    /// Finds the newest access request carrying `event`'s correlation labels.
    #[instrument(skip(self, event), fields(repo = %event.repo, run_id = %event.workflow_run_id, environment = %event.environment))]
    pub async fn find_existing_access_request(
        &self,
        event: &DeploymentReviewEvent,
    ) -> Result<Option<AccessRequest>> {
        let labels = CorrelationLabels::from_event(event);
        let filter = AccessRequestFilter {
            user: Some(self.config.user.clone()),
            labels: labels.to_map(),
            state: None,
        };

        let requests = self.access.get_access_requests(&filter).await?;
        Ok(requests
            .into_iter()
            .filter(|r| labels.matches(r))
            .max_by_key(|r| r.created()))
    }

    /// An unsubmitted request for the role `event`'s environment maps to.
    pub fn draft_access_request(&self, event: &DeploymentReviewEvent) -> Result<AccessRequest> {
        let role = self.role_for_environment(&event.environment)?;
        Ok(AccessRequest::draft(
            self.config.user.clone(),
            vec![role.to_string()],
        ))
    }

    /// Labels, describes and submits `draft` for `event`.
    #[instrument(skip(self, event, draft), fields(repo = %event.repo, run_id = %event.workflow_run_id, environment = %event.environment))]
    pub async fn create_access_request(
        &self,
        event: &DeploymentReviewEvent,
        mut draft: AccessRequest,
    ) -> Result<AccessRequest> {
        let labels = CorrelationLabels::from_event(event);
        self.automatically_denied(&labels)?;

        let info = self
            .github
            .get_workflow_run_info(&event.repo, event.workflow_run_id)
            .await?;
        let requester = if event.requester.is_empty() {
            info.requester.as_str()
        } else {
            event.requester.as_str()
        };

        labels.write_to(&mut draft)?;
        draft.set_reason(self.config.reason_template.render(&ReasonContext {
            organization: &event.repo.organization,
            repository: &event.repo.repository,
            workflow_name: &info.name,
            url: &info.url,
            environment: &event.environment,
            run_id: event.workflow_run_id.0,
            requester,
        }));
        draft.set_expires(Some(Utc::now() + self.config.request_ttl));

        let created = self.access.create_access_request(draft).await?;
        info!(request = %created.name(), roles = ?created.roles(), "created access request");
        Ok(created)
    }

    /// Posts a decided request's verdict to the workflow run it is labelled with.
    #[instrument(skip(self, request), fields(repo = %self.config.repo, request = %request.name()))]
    pub async fn handle_access_request_reviewed(&self, request: &AccessRequest) -> Result<()> {
        let labels = CorrelationLabels::read_from(request)?;
        let verdict = match request.state() {
            AccessRequestState::Approved => ReviewVerdict::Approved,
            AccessRequestState::Denied => ReviewVerdict::Rejected,
            AccessRequestState::Pending => {
                return Err(HandlerError::NotDecided(request.name().to_string()));
            }
        };

        if verdict == ReviewVerdict::Approved
            && let Err(denied) = self.automatically_denied(&labels)
        {
            warn!(error = %denied, "approval refused by guardrail; rejecting deployment");
            let comment = format!(
                "Access request {} was approved but automatically denied: {}",
                request.name(),
                denied
            );
            self.github
                .review_deployment_protection_rule(
                    &labels.repo,
                    labels.workflow_run_id,
                    ReviewVerdict::Rejected,
                    &labels.environment,
                    &comment,
                )
                .await?;
            return Err(denied);
        }

        let comment = review_comment(request);
        self.github
            .review_deployment_protection_rule(
                &labels.repo,
                labels.workflow_run_id,
                verdict,
                &labels.environment,
                &comment,
            )
            .await?;

        info!(
            run_id = %labels.workflow_run_id,
            environment = %labels.environment,
            %verdict,
            "posted deployment review"
        );
        Ok(())
    }
}

/// The comment posted with a verdict: the request id and who reviewed it.
fn review_comment(request: &AccessRequest) -> String {
    let reviewers = request.reviewers();
    let by = if reviewers.is_empty() {
        "an unrecorded reviewer".to_string()
    } else {
        reviewers.join(", ")
    };
    format!(
        "Access request {} {} by {}",
        request.name(),
        request.state(),
        by
    )
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Write-once map from repository to handler.
pub struct HandlerRegistry<G, A> {
    handlers: HashMap<RepoId, DecisionHandler<G, A>>,
}

impl<G: GitHubApi, A: AccessClient> HandlerRegistry<G, A> {
    pub fn new(handlers: impl IntoIterator<Item = DecisionHandler<G, A>>) -> Result<Self> {
        let mut map = HashMap::new();
        for handler in handlers {
            let repo = handler.repo().clone();
            if map.insert(repo.clone(), handler).is_some() {
                return Err(HandlerError::DuplicateRepository(repo));
            }
        }
        Ok(HandlerRegistry { handlers: map })
    }

    pub fn get(&self, repo: &RepoId) -> Option<&DecisionHandler<G, A>> {
        self.handlers.get(repo)
    }

    pub fn repos(&self) -> impl Iterator<Item = &RepoId> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
