//! Shared, incrementally persisted state for one run.
//!
//! The executor records each confirmed operation here. A record is only
//! ever mutated while holding its logical id's lock, and every mutation is
//! followed by a save, so the persisted state never contains an effect that
//! was not confirmed by the provider.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::store::StateStore;
use super::types::DeploymentState;

/// Snapshot bookkeeping for the save gate.
#[derive(Debug, Default)]
struct SaveGate {
    /// Highest generation written so far.
    saved: u64,
}

/// Shared state ledger.
pub struct StateLedger {
    /// Backend.
    store: Arc<dyn StateStore>,
    /// In-memory state with its generation counter.
    state: Mutex<(DeploymentState, u64)>,
    /// Per-logical-id locks.
    record_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes writes to the backend.
    gate: Mutex<SaveGate>,
}

impl std::fmt::Debug for StateLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLedger")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

impl StateLedger {
    /// Creates a ledger around a loaded state.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, state: DeploymentState) -> Self {
        Self {
            store,
            state: Mutex::new((state, 0)),
            record_locks: std::sync::Mutex::new(HashMap::new()),
            gate: Mutex::new(SaveGate::default()),
        }
    }

    fn record_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .record_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Reads from the current state.
    pub async fn read<T>(&self, f: impl FnOnce(&DeploymentState) -> T) -> T {
        f(&self.state.lock().await.0)
    }

    /// Returns a copy of the current state.
    pub async fn snapshot(&self) -> DeploymentState {
        self.state.lock().await.0.clone()
    }

    /// Mutates the record of `id` and persists the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails. The in-memory change is kept so
    /// that a later successful save still includes it.
    pub async fn commit<T>(&self, id: &str, f: impl FnOnce(&mut DeploymentState) -> T) -> Result<T> {
        let lock = self.record_lock(id);
        let _held = lock.lock().await;

        let (value, snapshot, generation) = {
            let mut guard = self.state.lock().await;
            let value = f(&mut guard.0);
            guard.1 += 1;
            (value, guard.0.clone(), guard.1)
        };

        self.persist(snapshot, generation).await?;
        debug!("Committed state change for '{id}' (generation {generation})");
        Ok(value)
    }

    /// Persists a snapshot unless a newer one is already stored.
    async fn persist(&self, snapshot: DeploymentState, generation: u64) -> Result<()> {
        let mut gate = self.gate.lock().await;
        if gate.saved >= generation {
            return Ok(());
        }
        self.store.save(&snapshot).await?;
        gate.saved = generation;
        Ok(())
    }

    /// Persists the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn flush(&self) -> Result<()> {
        let (snapshot, generation) = {
            let mut guard = self.state.lock().await;
            guard.1 += 1;
            (guard.0.clone(), guard.1)
        };
        self.persist(snapshot, generation).await
    }

    /// Consumes the ledger, returning the final state.
    pub fn into_state(self) -> DeploymentState {
        self.state.into_inner().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use crate::state::{LocalStateStore, StateRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_every_commit_is_persisted() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new(temp.path(), "u"));
        let ledger = StateLedger::new(Arc::clone(&store), DeploymentState::new("u"));

        ledger
            .commit("vpc", |s| s.set_record(StateRecord::new("vpc", ResourceKind::Network, "vpc-1")))
            .await
            .unwrap();

        let on_disk = store.load().await.unwrap().unwrap();
        assert!(on_disk.get_record("vpc").is_some());

        ledger.commit("vpc", |s| s.remove_record("vpc")).await.unwrap();
        let on_disk = store.load().await.unwrap().unwrap();
        assert!(on_disk.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_commits_all_land() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new(temp.path(), "u"));
        let ledger = Arc::new(StateLedger::new(Arc::clone(&store), DeploymentState::new("u")));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let ledger = Arc::clone(&ledger);
            tasks.spawn(async move {
                let id = format!("r{i}");
                ledger
                    .commit(&id, |s| s.set_record(StateRecord::new(&id, ResourceKind::Secret, &format!("s-{i}"))))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.records.len(), 20);
    }
}
