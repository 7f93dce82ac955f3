//! CI REST API error types.
//!
//! Errors are split into two kinds:
//!
//! - **Transient** errors may clear on a later attempt (5xx, rate limits,
//!   network failures)
//! - **Permanent** errors will not (most 4xx, malformed responses)
//!
//! Neither kind is retried in line. The dispatcher releases its dedup claim
//! on a transient failure so the reconciler's next pass can replay the event.

use std::fmt;
use thiserror::Error;

/// The kind of API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubErrorKind {
    /// May clear on a later attempt (HTTP 5xx, 429, rate-limited 403, timeouts).
    Transient,

    /// Retrying will not help (HTTP 4xx, unexpected response shapes).
    Permanent,
}

impl GitHubErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, GitHubErrorKind::Transient)
    }
}

/// An API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct GitHubApiError {
    pub kind: GitHubErrorKind,

    /// The HTTP status code, if available.
    pub status_code: Option<u16>,

    pub message: String,

    /// The underlying octocrab error, if available.
    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for GitHubApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "GitHub API error (HTTP {}): {}", code, self.message),
            None => write!(f, "GitHub API error: {}", self.message),
        }
    }
}

impl GitHubApiError {
    /// Creates a permanent error without an octocrab source.
    pub fn permanent_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: GitHubErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient error without an octocrab source.
    pub fn transient_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: GitHubErrorKind::Transient,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error from a bare HTTP status, categorized the same way as
    /// octocrab errors.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: categorize(Some(status_code), &message),
            status_code: Some(status_code),
            message,
            source: None,
        }
    }

    /// Categorizes an octocrab error.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status_code = extract_status_code(&err);
        let message = err.to_string();
        Self {
            kind: categorize(status_code, &message),
            status_code,
            message,
            source: Some(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(404)
    }
}

fn categorize(status_code: Option<u16>, message: &str) -> GitHubErrorKind {
    match status_code {
        Some(429) => GitHubErrorKind::Transient,
        Some(403) if is_rate_limit_error(message) => GitHubErrorKind::Transient,
        Some(code) if (500..600).contains(&code) => GitHubErrorKind::Transient,
        Some(_) => GitHubErrorKind::Permanent,
        None if is_network_error(message) => GitHubErrorKind::Transient,
        None => GitHubErrorKind::Permanent,
    }
}

/// Extracts the HTTP status code from an octocrab error, if present.
///
/// GitHub error responses carry the status directly. Other variants (hyper,
/// serde, service errors) are classified from their message instead.
fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    if let octocrab::Error::GitHub { source, .. } = err {
        return Some(source.status_code.as_u16());
    }
    status_from_message(&err.to_string())
}

fn status_from_message(message: &str) -> Option<u16> {
    let idx = message.find("status: ")?;
    let digits: String = message[idx + 8..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn is_rate_limit_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("rate limit")
        || message_lower.contains("secondary rate")
        || message_lower.contains("abuse detection")
}

fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("timed out")
        || message_lower.contains("connection")
        || message_lower.contains("dns")
}
