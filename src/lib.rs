//! Deployment Approver - gates GitHub Actions deployments on access requests.
//!
//! When a workflow run blocks on a deployment protection rule, the service files
//! an access request in the access-governance system, watches for a reviewer's
//! decision, and posts that decision back to the run. A periodic reconciler
//! repairs drift when webhooks or watch events are lost.

pub mod access;
pub mod approval;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod github;
pub mod leader;
pub mod reconcile;
pub mod server;
pub mod types;
pub mod watch;
pub mod webhooks;

#[cfg(test)]
mod test_utils;
