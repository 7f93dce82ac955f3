//! Access-governance client interface.
//!
//! The access-governance system owns access requests and their review
//! lifecycle. The service needs three things from it: list requests, create a
//! request, and watch for state changes. The [`AccessClient`] trait is that
//! boundary; [`memory::MemoryAccessClient`] is a complete in-process
//! implementation used by tests and local runs.

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{AccessRequest, AccessRequestState};

pub mod memory;

pub use memory::MemoryAccessClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("access request not found: {0}")]
    NotFound(String),

    #[error("access request already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid access request: {0}")]
    InvalidRequest(String),

    /// The backend could not be reached. Retrying later may succeed.
    #[error("access service unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, AccessError>;

/// Selects access requests. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequestFilter {
    /// Requesting user.
    pub user: Option<String>,
    /// Labels the request must carry (subset match).
    pub labels: BTreeMap<String, String>,
    pub state: Option<AccessRequestState>,
}

impl AccessRequestFilter {
    pub fn for_user(user: impl Into<String>) -> Self {
        AccessRequestFilter {
            user: Some(user.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, request: &AccessRequest) -> bool {
        if let Some(user) = &self.user
            && request.user() != user
        {
            return false;
        }
        if let Some(state) = self.state
            && request.state() != state
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(key, value)| request.label(key) == Some(value.as_str()))
    }
}

/// A change delivered on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A request was created or changed; carries its current state.
    Put(AccessRequest),
    /// A request was removed.
    Delete(String),
}

/// The access-governance operations used by the service.
pub trait AccessClient: Send + Sync + 'static {
    fn get_access_requests(
        &self,
        filter: &AccessRequestFilter,
    ) -> impl Future<Output = Result<Vec<AccessRequest>>> + Send;

    /// Submits a draft. Returns the stored request with its assigned name.
    fn create_access_request(
        &self,
        draft: AccessRequest,
    ) -> impl Future<Output = Result<AccessRequest>> + Send;

    /// Subscribes to changes of requests matching `filter`.
    ///
    /// The stream ends (the receiver yields `None`) when the backend drops the
    /// subscription; callers are expected to re-subscribe.
    fn watch_access_requests(
        &self,
        filter: AccessRequestFilter,
    ) -> impl Future<Output = Result<mpsc::Receiver<WatchEvent>>> + Send;
}
