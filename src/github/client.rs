//! Octocrab client wrapper.
//!
//! Unlike a per-repository client, one `GitHubClient` serves every configured
//! repository; each call names the repository it targets.
//!
//! octocrab resends requests that fail with a 5xx or 429 by default. That
//! middleware is switched off here: every call is a single attempt.

use octocrab::Octocrab;
use octocrab::service::middleware::retry::RetryConfig;

/// A GitHub REST client.
#[derive(Clone)]
pub struct GitHubClient {
    client: Octocrab,
}

impl GitHubClient {
    /// Creates a client authenticated with a personal or installation token.
    pub fn from_token(token: impl Into<String>) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder()
            .add_retry_config(RetryConfig::None)
            .personal_token(token.into())
            .build()?;
        Ok(Self { client })
    }

    /// Like [`from_token`](Self::from_token), against another API root such
    /// as a GitHub Enterprise Server (`https://host/api/v3`).
    pub fn from_token_at(
        token: impl Into<String>,
        base_uri: &str,
    ) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder()
            .add_retry_config(RetryConfig::None)
            .base_uri(base_uri)?
            .personal_token(token.into())
            .build()?;
        Ok(Self { client })
    }

    /// Wraps a pre-configured octocrab instance (e.g. GitHub App auth).
    ///
    /// The caller is responsible for turning off octocrab's own retries with
    /// `add_retry_config(RetryConfig::None)`.
    pub fn from_octocrab(client: Octocrab) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &Octocrab {
        &self.client
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient").finish_non_exhaustive()
    }
}
