//! Newtype wrappers for domain identifiers.
//!
//! These keep repository coordinates and workflow run ids from being mixed up
//! with the free-form strings that flow through the webhook and access-request
//! layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A repository identifier (`organization/repository`).
///
/// GitHub calls the first component the "owner"; for deployment approvals it is
/// always an organization, so that is the name used here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub organization: String,
    pub repository: String,
}

/// Error returned when a string is not in `organization/repository` form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository id {0:?}: expected organization/repository")]
pub struct InvalidRepoId(pub String);

impl RepoId {
    pub fn new(organization: impl Into<String>, repository: impl Into<String>) -> Self {
        RepoId {
            organization: organization.into(),
            repository: repository.into(),
        }
    }

    /// Parses `organization/repository`.
    ///
    /// Both halves must be non-empty and neither may contain a further `/`.
    pub fn parse(s: &str) -> Result<Self, InvalidRepoId> {
        match s.split_once('/') {
            Some((org, repo)) if !org.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Ok(RepoId::new(org, repo))
            }
            _ => Err(InvalidRepoId(s.to_string())),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.repository)
    }
}

/// A GitHub Actions workflow run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowRunId(pub u64);

impl fmt::Display for WorkflowRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for WorkflowRunId {
    fn from(n: u64) -> Self {
        WorkflowRunId(n)
    }
}
