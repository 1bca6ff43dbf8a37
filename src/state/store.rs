//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every store is bound to one deployment unit.

use async_trait::async_trait;

use crate::error::Result;
use super::types::DeploymentState;
use super::lock::LockInfo;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the unit's state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the unit's state.
    ///
    /// Either the previous or the new state is readable afterwards, never a
    /// mix of both.
    async fn save(&self, state: &DeploymentState) -> Result<()>;

    /// Deletes the unit's state and lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the run lock.
    ///
    /// An empty `holder` is replaced with a generated host-pid id.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Pushes the expiry of a held lock forward.
    ///
    /// Fails with `LockLost` if `lock_id` no longer holds the lock.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes the lock whoever holds it.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Human readable location of the state.
    fn location(&self) -> String;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
