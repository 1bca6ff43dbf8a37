//! Error types for the driftless reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph validation, provider calls, state persistence and
//! reconciliation.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the driftless engine.
#[derive(Debug, Error)]
pub enum DriftlessError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired graph validation errors.
    #[error("Validation error: {0}")]
    Graph(#[from] GraphError),

    /// Provider adapter errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors raised while building or validating the desired graph.
///
/// All of these surface before any provider call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share the same logical id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// A reference points at a node that is not declared.
    #[error("Resource '{from}' references unknown resource '{target}'")]
    DanglingReference {
        /// Node holding the reference.
        from: String,
        /// Missing target id.
        target: String,
    },

    /// The references form a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Ids along the cycle, first id repeated at the end.
        cycle: Vec<String>,
    },

    /// A reference names an output the target kind does not produce.
    #[error("Resource '{from}' references unknown output '{output}' of '{target}' ({kind})")]
    UnknownOutput {
        /// Node holding the reference.
        from: String,
        /// Target node id.
        target: String,
        /// Target kind.
        kind: String,
        /// Output attribute name.
        output: String,
    },

    /// No adapter is registered for a declared kind.
    #[error("No provider adapter registered for kind '{kind}'")]
    MissingAdapter {
        /// Resource kind without an adapter.
        kind: String,
    },
}

/// Errors returned by provider adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote resource does not exist (anymore).
    #[error("Resource not found: {physical_id}")]
    NotFound {
        /// Physical id that was looked up.
        physical_id: String,
    },

    /// The requested change cannot be applied in place.
    #[error("In-place update not supported for attributes: {}", attributes.join(", "))]
    Unsupported {
        /// Attributes that require replacement.
        attributes: Vec<String>,
    },

    /// Other live resources still reference this one.
    #[error("Resource {physical_id} still has dependents: {message}")]
    DependentsExist {
        /// Physical id of the resource.
        physical_id: String,
        /// Provider message.
        message: String,
    },

    /// Provider rejected the request as invalid.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Provider message.
        message: String,
    },

    /// Credentials were rejected.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Rate limited by the provider.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Eventual consistency: the resource is not visible yet.
    #[error("Resource not yet visible: {message}")]
    NotYetVisible {
        /// Provider message.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Timed out waiting for a resource to become ready.
    #[error("Timeout waiting for {physical_id} to reach state {expected_state}")]
    Timeout {
        /// Physical id of the resource.
        physical_id: String,
        /// Expected state that was not reached.
        expected_state: String,
    },

    /// The resource was created but reported a failed status.
    #[error("Resource {physical_id} failed to provision: {message}")]
    ProvisioningFailed {
        /// Physical id of the resource.
        physical_id: String,
        /// Provider message.
        message: String,
    },

    /// Any other provider failure.
    #[error("Provider request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The run lock was released or taken over while in use.
    #[error("State lock {lock_id} is no longer held")]
    LockLost {
        /// Id of the lost lock.
        lock_id: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A record addressed by the user does not exist.
    #[error("No state record for resource '{id}'")]
    UnknownRecord {
        /// Logical id.
        id: String,
    },

    /// An operation referenced an output that was not recorded.
    #[error("Resource '{id}' has unresolved references in: {}", attributes.join(", "))]
    UnresolvedReference {
        /// Logical id.
        id: String,
        /// Attributes holding the unresolved references.
        attributes: Vec<String>,
    },

    /// No adapter is registered for a kind.
    #[error("No provider adapter for kind '{kind}'")]
    NoAdapter {
        /// Kind name.
        kind: String,
    },

    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for driftless operations.
pub type Result<T> = std::result::Result<T, DriftlessError>;

impl DriftlessError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Returns true if the error is transient and the call may be retried.
    ///
    /// Readiness timeouts are not transient: the resource already exists and
    /// retrying the call would provision it twice.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::NotYetVisible { .. } | Self::NetworkError { .. }
        )
    }

    /// Returns the delay requested by the provider, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    /// Physical id of a resource that was created but never became ready.
    #[must_use]
    pub fn unready_resource(&self) -> Option<&str> {
        match self {
            Self::Timeout { physical_id, .. } | Self::ProvisioningFailed { physical_id, .. } => Some(physical_id),
            _ => None,
        }
    }

    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}
