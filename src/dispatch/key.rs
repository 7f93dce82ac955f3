//! Deduplication keys for dispatched events.
//!
//! # Key Formats
//!
//! - deployment review: `<organization>/<repository>/<workflow_run_id>/<environment>`
//! - access request review: the request's unique name
//!
//! Deployment reviews are keyed per workflow run *and* environment: one run can
//! block on several environments, each needing its own access request.

use std::fmt;

use crate::types::DeploymentReviewEvent;

/// A key identifying one logical event in the event cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey(String);

impl DedupeKey {
    pub fn deployment_review(event: &DeploymentReviewEvent) -> Self {
        DedupeKey(format!(
            "{}/{}/{}/{}",
            event.repo.organization, event.repo.repository, event.workflow_run_id, event.environment
        ))
    }

    pub fn access_request(name: &str) -> Self {
        DedupeKey(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
