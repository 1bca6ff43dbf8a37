//! Change sets and operations.
//!
//! A `ChangeSet` is the ordered list of operations the executor runs for one
//! deployment unit. It carries no timestamps, so identical inputs serialize
//! to identical bytes.

use serde::{Deserialize, Serialize};

use crate::error::{DriftlessError, Result};
use crate::model::{ResourceKind, ResourceNode};
use crate::provider::AttributeChange;

/// Types of operations in a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a resource that has no record.
    Create,
    /// Change updatable attributes in place.
    Update,
    /// Create a new resource for an existing logical id. The old one is
    /// removed by a separate `Delete`.
    Replace,
    /// Delete a physical resource.
    Delete,
}

impl ActionType {
    /// Short marker used in plan output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A single planned operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the change set.
    pub index: usize,
    /// Logical id.
    pub id: String,
    /// What to do.
    pub action: ActionType,
    /// Kind of the resource acted on. For a `Delete` this is the kind of
    /// the old resource.
    pub kind: ResourceKind,
    /// Operations that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<usize>,
    /// Attribute changes as seen at plan time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delta: Vec<AttributeChange>,
    /// Existing physical id, for `Update`, `Replace` and `Delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Desired node, for every action but `Delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<ResourceNode>,
    /// Human-readable reason.
    pub reason: String,
}

impl Operation {
    /// Returns true if the operation creates a physical resource.
    #[must_use]
    pub const fn creates(&self) -> bool {
        matches!(self.action, ActionType::Create | ActionType::Replace)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {} '{}'", self.action.symbol(), self.action, self.kind, self.id)?;
        if let Some(pid) = &self.physical_id {
            write!(f, " ({pid})")?;
        }
        Ok(())
    }
}

/// Per-action counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    /// Resources to create.
    pub creates: usize,
    /// Resources to update in place.
    pub updates: usize,
    /// Resources to replace.
    pub replaces: usize,
    /// Physical resources to delete.
    pub deletes: usize,
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.creates, self.updates, self.replaces, self.deletes
        )
    }
}

/// Ordered operations for one deployment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Deployment unit.
    pub unit: String,
    /// Operations; every dependency index is smaller than the operation's own.
    pub operations: Vec<Operation>,
}

impl ChangeSet {
    /// Creates an empty change set (no changes needed).
    #[must_use]
    pub fn empty(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            operations: Vec::new(),
        }
    }

    /// Appends an operation, assigning its index.
    pub(crate) fn push(&mut self, mut operation: Operation) -> usize {
        let index = self.operations.len();
        operation.index = index;
        operation.dependencies.sort_unstable();
        operation.dependencies.dedup();
        self.operations.push(operation);
        index
    }

    /// Returns true if nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns an operation by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    /// Counts operations per action.
    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for op in &self.operations {
            match op.action {
                ActionType::Create => summary.creates += 1,
                ActionType::Update => summary.updates += 1,
                ActionType::Replace => summary.replaces += 1,
                ActionType::Delete => summary.deletes += 1,
            }
        }
        summary
    }

    /// Logical ids touched by the change set, without duplicates.
    #[must_use]
    pub fn touched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.operations.iter().map(|op| op.id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Serializes the change set as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DriftlessError::internal(format!("Failed to serialize change set: {e}")))
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            return writeln!(f, "No changes. '{}' matches its declaration.", self.unit);
        }

        writeln!(f, "Change set for '{}':", self.unit)?;
        for op in &self.operations {
            write!(f, "  [{}] {op}", op.index)?;
            if !op.dependencies.is_empty() {
                let deps: Vec<String> = op.dependencies.iter().map(ToString::to_string).collect();
                write!(f, " after [{}]", deps.join(", "))?;
            }
            writeln!(f)?;
            writeln!(f, "      reason: {}", op.reason)?;
            for change in &op.delta {
                writeln!(f, "      {change}")?;
            }
        }
        writeln!(f, "\n{}", self.summary())
    }
}
