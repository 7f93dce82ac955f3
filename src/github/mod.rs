//! GitHub Actions client.
//!
//! - `api`: the [`GitHubApi`] trait and the data it returns
//! - `client`: the octocrab wrapper
//! - `rest`: the REST implementation of `GitHubApi`
//! - `error`: transient-vs-permanent classification
//! - `retry`: backoff schedules

mod api;
mod client;
mod error;
mod rest;
mod retry;

pub use api::{GitHubApi, PendingDeployment, ReviewVerdict, WorkflowRun, WorkflowRunInfo};
pub use client::GitHubClient;
pub use error::{GitHubApiError, GitHubErrorKind};
pub use retry::RetryConfig;
