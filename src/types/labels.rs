//! Correlation labels.
//!
//! The service keeps no state of its own. Everything needed to route an access
//! request's decision back to the blocked workflow run is stored on the request
//! itself as four static labels, written at creation and read back when the
//! request is reviewed or reconciled.

use std::collections::BTreeMap;

use thiserror::Error;

use super::access::AccessRequest;
use super::event::DeploymentReviewEvent;
use super::ids::{RepoId, WorkflowRunId};

pub const ORGANIZATION_LABEL: &str = "organization";
pub const REPOSITORY_LABEL: &str = "repository";
pub const ENVIRONMENT_LABEL: &str = "environment";
pub const WORKFLOW_RUN_ID_LABEL: &str = "workflow_run_id";

/// Why a request's labels could not be used for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("missing label {0:?}")]
    Missing(&'static str),

    #[error("label {0:?} is empty")]
    Empty(&'static str),

    #[error("label workflow_run_id has invalid value {0:?}")]
    InvalidRunId(String),
}

pub type Result<T> = std::result::Result<T, LabelError>;

/// The data linking an access request to one environment of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationLabels {
    pub repo: RepoId,
    pub environment: String,
    pub workflow_run_id: WorkflowRunId,
}

impl CorrelationLabels {
    pub fn from_event(event: &DeploymentReviewEvent) -> Self {
        CorrelationLabels {
            repo: event.repo.clone(),
            environment: event.environment.clone(),
            workflow_run_id: event.workflow_run_id,
        }
    }

    /// Checks that every field is present and the run id is non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.repo.organization.is_empty() {
            return Err(LabelError::Empty(ORGANIZATION_LABEL));
        }
        if self.repo.repository.is_empty() {
            return Err(LabelError::Empty(REPOSITORY_LABEL));
        }
        if self.environment.is_empty() {
            return Err(LabelError::Empty(ENVIRONMENT_LABEL));
        }
        if self.workflow_run_id.0 == 0 {
            return Err(LabelError::InvalidRunId("0".to_string()));
        }
        Ok(())
    }

    /// The labels as a map, ready to attach to a request.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ORGANIZATION_LABEL.to_string(), self.repo.organization.clone()),
            (REPOSITORY_LABEL.to_string(), self.repo.repository.clone()),
            (ENVIRONMENT_LABEL.to_string(), self.environment.clone()),
            (
                WORKFLOW_RUN_ID_LABEL.to_string(),
                self.workflow_run_id.to_string(),
            ),
        ])
    }

    /// Validates, then merges the labels into `request`'s existing labels.
    pub fn write_to(&self, request: &mut AccessRequest) -> Result<()> {
        self.validate()?;
        for (key, value) in self.to_map() {
            request.set_label(key, value);
        }
        Ok(())
    }

    /// Recovers the labels from a request, failing on any missing or empty field.
    pub fn read_from(request: &AccessRequest) -> Result<Self> {
        let organization = required(request, ORGANIZATION_LABEL)?;
        let repository = required(request, REPOSITORY_LABEL)?;
        let environment = required(request, ENVIRONMENT_LABEL)?;
        let raw_run_id = required(request, WORKFLOW_RUN_ID_LABEL)?;
        let run_id: u64 = raw_run_id
            .parse()
            .map_err(|_| LabelError::InvalidRunId(raw_run_id.to_string()))?;

        let labels = CorrelationLabels {
            repo: RepoId::new(organization, repository),
            environment: environment.to_string(),
            workflow_run_id: WorkflowRunId(run_id),
        };
        labels.validate()?;
        Ok(labels)
    }

    /// Returns true if `request` carries exactly these labels.
    pub fn matches(&self, request: &AccessRequest) -> bool {
        CorrelationLabels::read_from(request).is_ok_and(|labels| &labels == self)
    }
}

fn required<'a>(request: &'a AccessRequest, key: &'static str) -> Result<&'a str> {
    match request.label(key) {
        None => Err(LabelError::Missing(key)),
        Some("") => Err(LabelError::Empty(key)),
        Some(value) => Ok(value),
    }
}
