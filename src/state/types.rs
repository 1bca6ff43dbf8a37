//! State types for tracking last-applied resources.
//!
//! One `DeploymentState` exists per deployment unit. It holds a
//! `StateRecord` for every resource the engine has confirmed, keyed by
//! logical id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::StateError;
use crate::model::{Reference, ResolvedAttributes, ResourceKind};
use crate::provider::Outputs;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete state of one deployment unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Deployment unit (`<project>-<environment>`).
    pub unit: String,
    /// Last-applied records by logical id.
    #[serde(default)]
    pub records: BTreeMap<String, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Last-applied view of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Logical id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned id.
    pub physical_id: String,
    /// Attributes as last applied, references resolved.
    #[serde(default)]
    pub attributes: ResolvedAttributes,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Hash of `attributes`.
    pub attribute_hash: String,
    /// Logical ids this resource referenced when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Physical ids replaced by this resource and not deleted yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired: Vec<RetiredResource>,
    /// Created but never reported ready; replaced on the next apply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tainted: bool,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// A physical resource superseded by a replacement, awaiting deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredResource {
    /// Provider-assigned id of the old resource.
    pub physical_id: String,
    /// Kind of the old resource, which may differ after a kind change.
    pub kind: ResourceKind,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Declaration hash at the time of the run.
    pub config_hash: String,
    /// Logical ids touched by the run.
    pub resources: Vec<String>,
    /// Whether the run converged.
    pub success: bool,
    /// Optional failure summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Reconcile towards the declaration.
    Apply,
    /// Delete every managed resource.
    Destroy,
    /// Drop a record without touching the provider.
    Forget,
}

impl DeploymentState {
    /// Creates a new empty state for a unit.
    #[must_use]
    pub fn new(unit: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            unit: unit.to_string(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks that the state was written by a compatible version.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` if the major version differs.
    pub fn check_version(&self) -> Result<(), StateError> {
        let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
        if major(&self.version) == major(STATE_VERSION) {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }

    /// Gets a record by logical id.
    #[must_use]
    pub fn get_record(&self, id: &str) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Gets a mutable record by logical id.
    pub fn get_record_mut(&mut self, id: &str) -> Option<&mut StateRecord> {
        self.records.get_mut(id)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: StateRecord) {
        self.records.insert(record.id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by logical id.
    pub fn remove_record(&mut self, id: &str) -> Option<StateRecord> {
        let result = self.records.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Looks up a recorded output.
    #[must_use]
    pub fn output(&self, reference: &Reference) -> Option<Value> {
        self.records
            .get(&reference.target)
            .and_then(|r| r.outputs.get(&reference.output))
            .cloned()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all logical ids.
    #[must_use]
    pub fn record_ids(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StateRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(id: &str, kind: ResourceKind, physical_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            kind,
            physical_id: physical_id.to_string(),
            attributes: ResolvedAttributes::new(),
            outputs: Outputs::new(),
            attribute_hash: String::new(),
            dependencies: Vec::new(),
            retired: Vec::new(),
            tainted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the record as changed.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut state = DeploymentState::new("app-prod");
        for i in 0..105 {
            state.add_history(RunHistoryEntry::new(RunOperation::Apply, &i.to_string(), vec![]));
        }
        assert_eq!(state.history.len(), 100);
        assert_eq!(state.history[0].config_hash, "5");
    }

    #[test]
    fn test_version_check() {
        let mut state = DeploymentState::new("app-prod");
        assert!(state.check_version().is_ok());

        state.version = String::from("1.7");
        assert!(state.check_version().is_ok());

        state.version = String::from("2.0");
        assert!(matches!(
            state.check_version(),
            Err(StateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_output_lookup() {
        let mut state = DeploymentState::new("app-prod");
        let mut record = StateRecord::new("db", ResourceKind::Database, "db-1");
        record
            .outputs
            .insert(String::from("endpoint"), Value::from("db-1.internal"));
        state.set_record(record);

        assert_eq!(
            state.output(&Reference::new("db", "endpoint")),
            Some(Value::from("db-1.internal"))
        );
        assert_eq!(state.output(&Reference::new("db", "port")), None);
        assert_eq!(state.output(&Reference::new("vpc", "id")), None);
    }

    #[test]
    fn test_retired_omitted_when_empty() {
        let record = StateRecord::new("db", ResourceKind::Database, "db-1");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("retired").is_none());
    }
}
