//! Service configuration.
//!
//! Static configuration comes from a TOML file whose path is read from
//! `DEPLOY_APPROVER_CONFIG` (default `deploy-approver.toml`):
//!
//! ```toml
//! [access]
//! backend = "memory"
//!
//! [service]
//! listen_addr = "0.0.0.0:3000"
//! reconcile_interval_secs = 30
//! dedupe_ttl_secs = 60
//! queue_depth = 1
//! shutdown_timeout_secs = 5
//! request_ttl_hours = 4
//! # reason_template = "Deploy {repository} to {environment} ({url})"
//!
//! [[repositories]]
//! organization = "org"
//! repository = "repo"
//! user = "github-approver"
//!
//! [repositories.environments]
//! "build/prod" = "gha-build-prod"
//! ```
//!
//! `[access]` is required. It names the access-governance backend explicitly,
//! so the process never starts against a store nobody can review.
//!
//! Secrets never live in the file: `GITHUB_TOKEN` and `GITHUB_WEBHOOK_SECRET`
//! are read from the environment.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

use crate::approval::{HandlerConfig, ReasonTemplate, TemplateError};
use crate::dispatch::DispatcherConfig;
use crate::reconcile::ReconcileTarget;
use crate::types::RepoId;

pub const CONFIG_PATH_ENV: &str = "DEPLOY_APPROVER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "deploy-approver.toml";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const WEBHOOK_SECRET_ENV: &str = "GITHUB_WEBHOOK_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid reason template: {0}")]
    Template(#[from] TemplateError),

    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    pub access: AccessConfig,

    pub repositories: Vec<RepositoryConfig>,

    /// Parsed from `service.reason_template` during validation.
    #[serde(skip)]
    reason_template: ReasonTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessConfig {
    pub backend: AccessBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessBackend {
    /// Process-local store. Requests are lost on restart and can only be
    /// reviewed from inside the process; suitable for local runs and demos.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Lifetime of created access requests.
    #[serde(default = "default_request_ttl_hours")]
    pub request_ttl_hours: u64,

    /// Overrides the built-in access-request reason.
    #[serde(default)]
    pub reason_template: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen_addr: default_listen_addr(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
            queue_depth: default_queue_depth(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            request_ttl_hours: default_request_ttl_hours(),
            reason_template: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_dedupe_ttl_secs() -> u64 {
    60
}

fn default_queue_depth() -> usize {
    1
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_request_ttl_hours() -> u64 {
    4
}

/// One repository whose deployments are approved through access requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub organization: String,
    pub repository: String,
    /// User the access requests are filed as.
    pub user: String,
    /// Environment name to requested role.
    pub environments: BTreeMap<String, String>,
}

impl RepositoryConfig {
    pub fn repo_id(&self) -> RepoId {
        RepoId::new(self.organization.clone(), self.repository.clone())
    }
}

impl Config {
    /// Reads the file named by `DEPLOY_APPROVER_CONFIG`, or the default path.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::from_file(Path::new(&path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        let service = &self.service;
        if service.reconcile_interval_secs == 0 {
            return Err(invalid("service.reconcile_interval_secs must be non-zero"));
        }
        if service.dedupe_ttl_secs == 0 {
            return Err(invalid("service.dedupe_ttl_secs must be non-zero"));
        }
        if service.queue_depth == 0 {
            return Err(invalid("service.queue_depth must be non-zero"));
        }
        if service.request_ttl_hours == 0 || self.request_ttl_checked().is_none() {
            return Err(invalid("service.request_ttl_hours is out of range"));
        }

        if self.repositories.is_empty() {
            return Err(invalid("at least one [[repositories]] entry is required"));
        }
        let mut seen = BTreeSet::new();
        for repo in &self.repositories {
            validate_repository(repo)?;
            if !seen.insert((repo.organization.as_str(), repo.repository.as_str())) {
                return Err(invalid(format!(
                    "repository {}/{} is configured more than once",
                    repo.organization, repo.repository
                )));
            }
        }

        if let Some(template) = &self.service.reason_template {
            self.reason_template = ReasonTemplate::parse(template)?;
        }
        Ok(())
    }

    fn request_ttl_checked(&self) -> Option<TimeDelta> {
        i64::try_from(self.service.request_ttl_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_depth: self.service.queue_depth,
            dedupe_ttl: Duration::from_secs(self.service.dedupe_ttl_secs),
            shutdown_timeout: Duration::from_secs(self.service.shutdown_timeout_secs),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.service.reconcile_interval_secs)
    }

    pub fn handler_configs(&self) -> Vec<HandlerConfig> {
        // Checked by `validate`.
        let request_ttl = self.request_ttl_checked().unwrap_or(TimeDelta::hours(4));
        self.repositories
            .iter()
            .map(|repo| HandlerConfig {
                repo: repo.repo_id(),
                user: repo.user.clone(),
                environments: repo.environments.clone(),
                request_ttl,
                reason_template: self.reason_template.clone(),
            })
            .collect()
    }

    pub fn reconcile_targets(&self) -> Vec<ReconcileTarget> {
        self.repositories
            .iter()
            .map(|repo| ReconcileTarget {
                repo: repo.repo_id(),
                user: repo.user.clone(),
                environments: repo.environments.keys().cloned().collect(),
            })
            .collect()
    }

    /// Distinct access-request users, one watch subscription each.
    pub fn users(&self) -> BTreeSet<String> {
        self.repositories.iter().map(|r| r.user.clone()).collect()
    }
}

fn validate_repository(repo: &RepositoryConfig) -> Result<()> {
    let name = format!("{}/{}", repo.organization, repo.repository);
    for (field, value) in [
        ("organization", &repo.organization),
        ("repository", &repo.repository),
    ] {
        if value.is_empty() || value.contains('/') {
            return Err(invalid(format!("{name}: invalid {field} {value:?}")));
        }
    }
    if repo.user.is_empty() {
        return Err(invalid(format!("{name}: user must be set")));
    }
    if repo.environments.is_empty() {
        return Err(invalid(format!("{name}: at least one environment is required")));
    }
    for (environment, role) in &repo.environments {
        if environment.is_empty() {
            return Err(invalid(format!("{name}: empty environment name")));
        }
        if role.is_empty() {
            return Err(invalid(format!(
                "{name}: environment {environment:?} maps to an empty role"
            )));
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

/// Credentials read from the environment.
pub struct Secrets {
    pub github_token: String,
    pub webhook_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        Ok(Secrets {
            github_token: required_env(GITHUB_TOKEN_ENV)?,
            webhook_secret: required_env(WEBHOOK_SECRET_ENV)?,
        })
    }
}

fn required_env(name: &'static str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::approval::ReasonContext;

    const MINIMAL: &str = r#"
        [access]
        backend = "memory"

        [[repositories]]
        organization = "org"
        repository = "repo"
        user = "github-approver"

        [repositories.environments]
        "build/prod" = "gha-build-prod"
        "build/stage" = "gha-build-stage"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.service, ServiceConfig::default());
        assert_eq!(config.access.backend, AccessBackend::Memory);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.queue_depth, 1);
        assert_eq!(dispatcher.dedupe_ttl, Duration::from_secs(60));

        let handlers = config.handler_configs();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].repo, RepoId::new("org", "repo"));
        assert_eq!(handlers[0].request_ttl, TimeDelta::hours(4));
        assert_eq!(handlers[0].environments["build/prod"], "gha-build-prod");
        assert_eq!(handlers[0].reason_template, ReasonTemplate::default());

        let targets = config.reconcile_targets();
        assert_eq!(
            targets[0].environments,
            BTreeSet::from(["build/prod".to_string(), "build/stage".to_string()])
        );
    }

    #[test]
    fn full_config_round_trips_through_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [access]
            backend = "memory"

            [service]
            listen_addr = "127.0.0.1:8080"
            reconcile_interval_secs = 10
            dedupe_ttl_secs = 120
            queue_depth = 4
            shutdown_timeout_secs = 2
            request_ttl_hours = 1
            reason_template = "deploy {{repository}} run {{run_id}}"

            [[repositories]]
            organization = "org"
            repository = "a"
            user = "bot-a"
            environments = {{ prod = "role-a" }}

            [[repositories]]
            organization = "org"
            repository = "b"
            user = "bot-b"
            environments = {{ prod = "role-b" }}
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.service.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.dispatcher_config().queue_depth, 4);
        assert_eq!(config.users(), BTreeSet::from(["bot-a".into(), "bot-b".into()]));

        let handler = &config.handler_configs()[1];
        assert_eq!(handler.request_ttl, TimeDelta::hours(1));
        let reason = handler.reason_template.render(&ReasonContext {
            organization: "org",
            repository: "b",
            workflow_name: "Deploy",
            url: "",
            environment: "prod",
            run_id: 42,
            requester: "alice",
        });
        assert_eq!(reason, "deploy b run 42");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let toml = format!("{MINIMAL}\n[service]\nlisten_port = 3000\n");
        assert!(matches!(Config::from_toml(&toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let toml = format!("[service]\nreason_template = \"{{branch}}\"\n{MINIMAL}");
        assert!(matches!(
            Config::from_toml(&toml),
            Err(ConfigError::Template(TemplateError::UnknownPlaceholder(_)))
        ));
    }

    #[test]
    fn access_backend_must_be_chosen() {
        let without_access = MINIMAL.replace("[access]\n        backend = \"memory\"\n", "");
        assert!(!without_access.contains("[access]"));
        assert!(matches!(
            Config::from_toml(&without_access),
            Err(ConfigError::Parse(_))
        ));

        let unknown = MINIMAL.replace("\"memory\"", "\"ldap\"");
        assert!(matches!(Config::from_toml(&unknown), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn blank_reason_template_is_rejected() {
        for template in ["", "   ", "{url}"] {
            let toml = format!("[service]\nreason_template = \"{template}\"\n{MINIMAL}");
            assert!(
                matches!(
                    Config::from_toml(&toml),
                    Err(ConfigError::Template(TemplateError::Blank))
                ),
                "expected rejection of {template:?}"
            );
        }
    }

    #[test]
    fn validation_failures() {
        let access = "[access]\nbackend = \"memory\"\n";
        let repository = r#"
            [[repositories]]
            organization = "org"
            repository = "repo"
            user = "bot"
            environments = { prod = "role" }
            "#;
        let cases = [
            // No repositories.
            format!("repositories = []\n{access}"),
            // Duplicate repository.
            format!("{MINIMAL}{repository}"),
            // No environments.
            format!("{access}{}", repository.replace(r#"{ prod = "role" }"#, "{}")),
            // Empty role.
            format!("{access}{}", repository.replace(r#""role""#, r#""""#)),
            // Slash in repository.
            format!("{access}{}", repository.replace(r#""repo""#, r#""a/b""#)),
            // Zero interval.
            format!("[service]\nreconcile_interval_secs = 0\n{MINIMAL}"),
            format!("[service]\nqueue_depth = 0\n{MINIMAL}"),
            format!("[service]\nrequest_ttl_hours = 0\n{MINIMAL}"),
        ];

        for toml in cases {
            assert!(
                matches!(Config::from_toml(&toml), Err(ConfigError::Validation(_))),
                "expected validation error for:\n{toml}"
            );
        }
    }
}
