//! Declaration file types.
//!
//! This module defines the structs that map to `driftless.yaml`. The
//! `resources` list is the desired graph; everything else configures how the
//! engine reaches the provider and where it keeps state.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::model::ResourceNode;

/// Default environment variable holding the provider token.
pub const DEFAULT_TOKEN_ENV: &str = "DRIFTLESS_PROVIDER_TOKEN";

/// The root of a declaration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftlessConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider gateway configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceNode>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Root directory for the local backend (default `.driftless`).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint of an S3-compatible service.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Base URL of the gateway.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
    /// Readiness polling interval.
    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(min = 1, max = 300))]
    pub poll_interval_secs: u64,
    /// Readiness timeout.
    #[serde(default = "default_ready_timeout_secs")]
    #[validate(range(min = 1, max = 7200))]
    pub ready_timeout_secs: u64,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum operations in flight.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,
    /// Attempts per operation, first call included.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Backoff base delay.
    #[serde(default = "default_base_delay_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub base_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_delay_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub max_delay_ms: u64,
    /// How placeholder literals are treated.
    #[serde(default)]
    pub placeholders: PlaceholderPolicy,
}

/// Treatment of placeholder literals such as `your-ecr-repo`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderPolicy {
    /// Validation error.
    #[default]
    Reject,
    /// Validation warning.
    Warn,
    /// Ordinary literal.
    Allow,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from(DEFAULT_TOKEN_ENV)
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_ready_timeout_secs() -> u64 {
    900
}

const fn default_concurrency() -> usize {
    5
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            placeholders: PlaceholderPolicy::default(),
        }
    }
}

impl DriftlessConfig {
    /// Returns the deployment unit name (`<project>-<environment>`).
    #[must_use]
    pub fn unit(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource ids in declaration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let execution = ExecutionConfig::default();
        assert_eq!(execution.concurrency, 5);
        assert_eq!(execution.placeholders, PlaceholderPolicy::Reject);
        assert!(execution.validate().is_ok());

        assert_eq!(ProviderConfig::default().token_env, DEFAULT_TOKEN_ENV);
    }

    #[test]
    fn test_execution_bounds() {
        let execution = ExecutionConfig {
            concurrency: 0,
            ..ExecutionConfig::default()
        };
        assert!(execution.validate().is_err());
    }
}
