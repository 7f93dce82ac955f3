//! Webhook payload parser.
//!
//! Parses raw webhook JSON into the events the dispatcher understands:
//!
//! 1. The event type comes from the `X-GitHub-Event` header
//! 2. `deployment_protection_rule` with action `requested` becomes a
//!    [`DeploymentReviewEvent`]; the run id is recovered from
//!    `deployment_callback_url`
//! 3. `workflow_dispatch` becomes a [`WorkflowDispatchEvent`]
//! 4. Everything else is [`WebhookEvent::Ignored`], not an error
//!
//! Malformed payloads for the two recognised types return `Err`.

use serde::Deserialize;
use thiserror::Error;

use crate::types::{DeploymentReviewEvent, RepoId, WorkflowDispatchEvent, WorkflowRunId};

#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid field value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// A recognised webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    DeploymentReview(DeploymentReviewEvent),
    WorkflowDispatch(WorkflowDispatchEvent),
    /// Acknowledged but not acted on.
    Ignored {
        event_type: String,
        action: Option<String>,
    },
}

pub fn parse_webhook(event_type: &str, payload: &[u8]) -> Result<WebhookEvent, ParseError> {
    match event_type {
        "deployment_protection_rule" => parse_deployment_protection_rule(payload),
        "workflow_dispatch" => parse_workflow_dispatch(payload).map(WebhookEvent::WorkflowDispatch),
        other => Ok(WebhookEvent::Ignored {
            event_type: other.to_string(),
            action: None,
        }),
    }
}

// ─── Raw Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawRepository {
    owner: RawUser,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawDeploymentProtectionRulePayload {
    action: String,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    deployment_callback_url: Option<String>,
    #[serde(default)]
    deployment: Option<RawDeployment>,
    repository: RawRepository,
    #[serde(default)]
    sender: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawDeployment {
    #[serde(default)]
    creator: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowDispatchPayload {
    workflow: String,
    #[serde(rename = "ref")]
    git_ref: String,
    repository: RawRepository,
    sender: RawUser,
}

// ─── deployment_protection_rule ───────────────────────────────────────────────

fn parse_deployment_protection_rule(payload: &[u8]) -> Result<WebhookEvent, ParseError> {
    let raw: RawDeploymentProtectionRulePayload = serde_json::from_slice(payload)?;

    if raw.action != "requested" {
        return Ok(WebhookEvent::Ignored {
            event_type: "deployment_protection_rule".to_string(),
            action: Some(raw.action),
        });
    }

    let environment = raw
        .environment
        .filter(|e| !e.is_empty())
        .ok_or(ParseError::InvalidField {
            field: "environment",
            value: String::new(),
        })?;

    let callback_url = raw.deployment_callback_url.unwrap_or_default();
    let run_id = run_id_from_callback_url(&callback_url).ok_or(ParseError::InvalidField {
        field: "deployment_callback_url",
        value: callback_url.clone(),
    })?;

    // The sender is whoever triggered the run; the deployment creator is the
    // fallback for payloads without one.
    let requester = raw
        .sender
        .or(raw.deployment.and_then(|d| d.creator))
        .map(|u| u.login)
        .unwrap_or_default();

    Ok(WebhookEvent::DeploymentReview(DeploymentReviewEvent::new(
        RepoId::new(raw.repository.owner.login, raw.repository.name),
        environment,
        run_id,
        requester,
    )))
}

/// Extracts the run id from a callback URL of the form
/// `.../actions/runs/{id}/deployment_protection_rule`.
pub fn run_id_from_callback_url(url: &str) -> Option<WorkflowRunId> {
    const MARKER: &str = "/actions/runs/";
    let start = url.find(MARKER)? + MARKER.len();
    let rest = &url[start..];
    let digits = rest.split(['/', '?']).next()?;
    match digits.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(id) => Some(WorkflowRunId(id)),
    }
}

// ─── workflow_dispatch ────────────────────────────────────────────────────────

fn parse_workflow_dispatch(payload: &[u8]) -> Result<WorkflowDispatchEvent, ParseError> {
    let raw: RawWorkflowDispatchPayload = serde_json::from_slice(payload)?;
    Ok(WorkflowDispatchEvent {
        repo: RepoId::new(raw.repository.owner.login, raw.repository.name),
        workflow: raw.workflow,
        git_ref: raw.git_ref,
        requester: raw.sender.login,
    })
}
