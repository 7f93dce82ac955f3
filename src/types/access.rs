//! The access-request record as seen by this service.
//!
//! The access-governance system owns these records. The service only needs a
//! handful of fields from them: state, static labels (which carry the
//! correlation data back to the CI run), expiry, reason, and who reviewed it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRequestState {
    Pending,
    Approved,
    Denied,
}

impl AccessRequestState {
    pub fn is_pending(&self) -> bool {
        matches!(self, AccessRequestState::Pending)
    }

    /// Returns true for terminal states (approved or denied).
    pub fn is_decided(&self) -> bool {
        !self.is_pending()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRequestState::Pending => "pending",
            AccessRequestState::Approved => "approved",
            AccessRequestState::Denied => "denied",
        }
    }
}

impl fmt::Display for AccessRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single review recorded on an access request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReview {
    /// The reviewer's user name.
    pub author: String,
    /// The state this review proposed.
    pub state: AccessRequestState,
    /// Free-text reason given by the reviewer.
    pub reason: String,
    pub created: DateTime<Utc>,
}

/// An access request.
///
/// Fields are private; the accessors mirror the get/set surface exposed by the
/// access-governance client so that the rest of the service never depends on
/// its wire representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    name: String,
    user: String,
    roles: Vec<String>,
    state: AccessRequestState,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    expires: Option<DateTime<Utc>>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    reviews: Vec<AccessReview>,
    created: DateTime<Utc>,
}

impl AccessRequest {
    /// Creates a pending request with a known name.
    pub fn new(name: impl Into<String>, user: impl Into<String>, roles: Vec<String>) -> Self {
        AccessRequest {
            name: name.into(),
            user: user.into(),
            roles,
            state: AccessRequestState::Pending,
            labels: BTreeMap::new(),
            expires: None,
            reason: String::new(),
            reviews: Vec::new(),
            created: Utc::now(),
        }
    }

    /// Creates an unsubmitted draft. The access-governance system assigns the name.
    pub fn draft(user: impl Into<String>, roles: Vec<String>) -> Self {
        Self::new(String::new(), user, roles)
    }

    /// The request's unique name. Empty for drafts.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn state(&self) -> AccessRequestState {
        self.state
    }

    pub fn set_state(&mut self, state: AccessRequestState) {
        self.state = state;
    }

    /// Static labels attached at creation time.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels = labels;
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    pub fn set_expires(&mut self, expires: Option<DateTime<Utc>>) {
        self.expires = expires;
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub fn reviews(&self) -> &[AccessReview] {
        &self.reviews
    }

    pub fn add_review(&mut self, review: AccessReview) {
        self.reviews.push(review);
    }

    /// Distinct reviewer names, in review order.
    pub fn reviewers(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::with_capacity(self.reviews.len());
        for review in &self.reviews {
            if !seen.contains(&review.author.as_str()) {
                seen.push(&review.author);
            }
        }
        seen
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}
