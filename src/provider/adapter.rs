//! Provider adapter contract.
//!
//! One adapter exists per resource kind. The engine only ever talks to remote
//! resources through this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::model::{ResolvedAttributes, ResourceKind};

/// Computed outputs of a resource (endpoint, arn, ...).
pub type Outputs = BTreeMap<String, Value>;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A single attribute difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Previous value, `None` if the attribute was absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    /// New value, `None` if absent or not known until apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    /// The new value depends on an output produced during this run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub known_after_apply: bool,
}

impl AttributeChange {
    /// Creates a change between two known values.
    #[must_use]
    pub fn new(name: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            name: name.into(),
            before,
            after,
            known_after_apply: false,
        }
    }

    /// Creates a change whose new value is computed during the run.
    #[must_use]
    pub fn known_after_apply(name: impl Into<String>, before: Option<Value>) -> Self {
        Self {
            name: name.into(),
            before,
            after: None,
            known_after_apply: true,
        }
    }
}

impl std::fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("(none)"), Value::to_string);
        if self.known_after_apply {
            write!(f, "{}: {} -> (known after apply)", self.name, show(&self.before))
        } else {
            write!(f, "{}: {} -> {}", self.name, show(&self.before), show(&self.after))
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Computed outputs.
    pub outputs: Outputs,
}

/// Capability contract for one resource kind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Kind handled by this adapter.
    fn kind(&self) -> ResourceKind;

    /// Attributes that can change without replacing the resource.
    fn updatable_attributes(&self) -> Vec<String>;

    /// Output attributes other nodes may reference.
    fn output_attributes(&self) -> Vec<String>;

    /// Creates the resource.
    async fn create(&self, attributes: &ResolvedAttributes) -> ProviderResult<CreateOutcome>;

    /// Reads the live attributes. `NotFound` if the resource vanished.
    async fn read(&self, physical_id: &str) -> ProviderResult<ResolvedAttributes>;

    /// Applies the changed attributes in place.
    ///
    /// Removed attributes are sent as `null`. Returns `Unsupported` if any
    /// of them requires replacement.
    async fn update(&self, physical_id: &str, delta: &ResolvedAttributes) -> ProviderResult<Outputs>;

    /// Deletes the resource. `DependentsExist` while still referenced.
    async fn delete(&self, physical_id: &str) -> ProviderResult<()>;

    /// Compares recorded attributes with the live resource.
    async fn compute_drift(
        &self,
        physical_id: &str,
        recorded: &ResolvedAttributes,
    ) -> ProviderResult<Vec<AttributeChange>>;
}

/// Lists the recorded attributes whose live value differs.
///
/// Attributes the provider adds on its own are ignored.
#[must_use]
pub fn diff_attributes(recorded: &ResolvedAttributes, live: &ResolvedAttributes) -> Vec<AttributeChange> {
    recorded
        .iter()
        .filter(|(name, value)| live.get(*name) != Some(*value))
        .map(|(name, value)| AttributeChange::new(name.clone(), Some(value.clone()), live.get(name).cloned()))
        .collect()
}
