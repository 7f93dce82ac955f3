//! Core domain types for the deployment approver.
//!
//! Identifiers, the CI events that start an approval, the access-request
//! record, and the correlation labels that tie the two together.

pub mod access;
pub mod event;
pub mod ids;
pub mod labels;

pub use access::{AccessRequest, AccessRequestState, AccessReview};
pub use event::{DeploymentReviewEvent, WorkflowDispatchEvent};
pub use ids::{InvalidRepoId, RepoId, WorkflowRunId};
pub use labels::{CorrelationLabels, LabelError};
