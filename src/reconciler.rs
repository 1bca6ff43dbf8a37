//! Reconciler driving one deployment unit towards its declaration.
//!
//! Every run builds and validates the desired graph before touching a
//! provider, so declaration errors abort with zero side effects. Mutating
//! runs hold the unit's run lock for their whole duration.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, DriftlessConfig};
use crate::error::{DriftlessError, ProviderError, ReconcileError, Result};
use crate::model::{DesiredGraph, GraphBuilder, ResourceKind, ValidatedGraph};
use crate::planner::{ChangeSet, DiffEngine, ExecutionReport, ExecutorOptions, PlanExecutor};
use crate::provider::{AttributeChange, ProviderRegistry};
use crate::state::{
    DeploymentState, RunHistoryEntry, RunOperation, StateLedger, StateRecord, StateStore, LOCK_REFRESH_SECS,
};

/// Ledger key for run history commits. Not a valid logical id.
const HISTORY_KEY: &str = "#history";

/// Builds the desired graph of a declaration and checks it against the
/// registered adapters.
///
/// # Errors
///
/// Returns a graph error for duplicate ids, dangling references, cycles,
/// unknown outputs or kinds without an adapter.
pub fn build_graph(config: &DriftlessConfig, registry: &ProviderRegistry) -> Result<ValidatedGraph> {
    let graph = DesiredGraph::from_nodes(config.unit(), config.resources.iter().cloned())?;
    let graph = GraphBuilder::new().build(graph)?;
    registry.validate_graph(&graph)?;
    debug!("Desired graph for '{}' has {} nodes", graph.unit(), config.resources.len());
    Ok(graph)
}

/// Reconciler for one deployment unit.
pub struct Reconciler<'a> {
    /// Declaration.
    config: &'a DriftlessConfig,
    /// State backend for the unit.
    store: Arc<dyn StateStore>,
    /// Adapters by kind.
    registry: ProviderRegistry,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Executor tuning.
    options: ExecutorOptions,
    /// Cancellation signal for executions.
    cancel: Option<watch::Receiver<bool>>,
    /// Lock holder id; empty lets the store generate one.
    holder: String,
    /// Interval between run lock refreshes.
    lock_refresh: Duration,
}

/// Change set and report of a mutating run.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    /// The executed change set.
    pub plan: ChangeSet,
    /// Per-operation results.
    pub report: ExecutionReport,
}

impl RunOutcome {
    /// Process exit code for the run.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.report.exit_code()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a DriftlessConfig, store: Arc<dyn StateStore>, registry: ProviderRegistry) -> Self {
        Self {
            config,
            store,
            registry,
            hasher: ConfigHasher::new(),
            options: ExecutorOptions::from(&config.execution),
            cancel: None,
            holder: String::new(),
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        }
    }

    /// Stops starting operations once `cancel` turns `true`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Sets the run lock holder id.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets how often a running apply or destroy renews its lock.
    #[must_use]
    pub const fn with_lock_refresh(mut self, interval: Duration) -> Self {
        self.lock_refresh = interval;
        self
    }

    /// Builds and validates the desired graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for duplicate ids, dangling references, cycles,
    /// unknown outputs or kinds without an adapter.
    pub fn desired_graph(&self) -> Result<ValidatedGraph> {
        build_graph(self.config, &self.registry)
    }

    /// Loads the unit's state, or an empty one.
    async fn load_state(&self) -> Result<DeploymentState> {
        Ok(self
            .store
            .load()
            .await?
            .unwrap_or_else(|| DeploymentState::new(&self.config.unit())))
    }

    /// Computes the change set without executing it.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the state cannot be loaded.
    pub async fn plan(&self) -> Result<ChangeSet> {
        let graph = self.desired_graph()?;
        let state = self.load_state().await?;
        let plan = DiffEngine::new(&self.registry).compute(&graph, &state);
        info!("Plan for '{}': {}", plan.unit, plan.summary());
        Ok(plan)
    }

    /// Reconciles the unit towards its declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, the lock is held elsewhere or
    /// the state cannot be loaded. Operation failures are reported in the
    /// outcome instead.
    pub async fn apply(&self) -> Result<RunOutcome> {
        info!("Applying declaration for '{}'", self.config.unit());
        let graph = self.desired_graph()?;
        self.locked(RunOperation::Apply, graph).await
    }

    /// Deletes every recorded resource of the unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or the state cannot be
    /// loaded.
    pub async fn destroy(&self) -> Result<RunOutcome> {
        info!("Destroying every resource of '{}'", self.config.unit());
        let empty = GraphBuilder::new().build(DesiredGraph::new(self.config.unit()))?;
        self.locked(RunOperation::Destroy, empty).await
    }

    /// Runs `graph` under the run lock, releasing it whatever happens.
    ///
    /// The lock is refreshed every `lock_refresh` while the run lasts.
    async fn locked(&self, operation: RunOperation, graph: ValidatedGraph) -> Result<RunOutcome> {
        let lock = self.store.acquire_lock(&self.holder, &operation.to_string()).await?;

        let run = self.execute(operation, &graph);
        tokio::pin!(run);
        let mut refresh = tokio::time::interval(self.lock_refresh.max(Duration::from_millis(10)));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = refresh.tick() => {
                    match self.store.refresh_lock(&lock.lock_id).await {
                        Ok(info) => debug!("State lock {} now expires at {}", info.lock_id, info.expires_at),
                        Err(e) => warn!("Failed to refresh state lock {}: {e}", lock.lock_id),
                    }
                }
            }
        };

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn execute(&self, operation: RunOperation, graph: &ValidatedGraph) -> Result<RunOutcome> {
        let state = self.load_state().await?;
        let plan = DiffEngine::new(&self.registry).compute(graph, &state);
        info!("Change set: {}", plan.summary());

        let ledger = Arc::new(StateLedger::new(Arc::clone(&self.store), state));
        let mut executor =
            PlanExecutor::new(self.registry.clone(), Arc::clone(&ledger)).with_options(self.options.clone());
        if let Some(cancel) = &self.cancel {
            executor = executor.with_cancellation(cancel.clone());
        }

        let report = executor.execute(&plan).await;

        if !plan.is_empty() {
            let config_hash = self.hasher.hash_config(self.config);
            let entry = match report.failure_summary() {
                None => RunHistoryEntry::new(operation, &config_hash, plan.touched_ids()),
                Some(summary) => RunHistoryEntry::failed(operation, &config_hash, plan.touched_ids(), &summary),
            };
            if let Err(e) = ledger.commit(HISTORY_KEY, |state| state.add_history(entry)).await {
                error!("Failed to record run history: {e}");
            }
        }

        Ok(RunOutcome { plan, report })
    }

    /// Compares every record with its live resource.
    ///
    /// Read-only: neither state nor providers are changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in '{}'", self.config.unit());
        let state = self.load_state().await?;
        let mut resources = Vec::with_capacity(state.records.len());

        for record in state.records.values() {
            let status = self.drift_of(record).await;
            if status != DriftStatus::InSync {
                warn!("'{}' ({}) has drifted", record.id, record.physical_id);
            }
            resources.push(ResourceDrift {
                id: record.id.clone(),
                kind: record.kind,
                physical_id: record.physical_id.clone(),
                status,
            });
        }

        let declared = self.config.resource_ids();
        let undeclared = state
            .record_ids()
            .into_iter()
            .filter(|id| !declared.contains(id))
            .map(String::from)
            .collect();
        let unrecorded = declared
            .into_iter()
            .filter(|id| state.get_record(id).is_none())
            .map(String::from)
            .collect();

        Ok(DriftReport {
            unit: self.config.unit(),
            resources,
            unrecorded,
            undeclared,
        })
    }

    async fn drift_of(&self, record: &StateRecord) -> DriftStatus {
        let Some(adapter) = self.registry.get(record.kind) else {
            return DriftStatus::Error {
                message: ReconcileError::NoAdapter {
                    kind: record.kind.to_string(),
                }
                .to_string(),
            };
        };

        match adapter.compute_drift(&record.physical_id, &record.attributes).await {
            Ok(changes) if changes.is_empty() => DriftStatus::InSync,
            Ok(changes) => DriftStatus::Drifted { changes },
            Err(ProviderError::NotFound { .. }) => DriftStatus::Missing,
            Err(e) => DriftStatus::Error { message: e.to_string() },
        }
    }

    /// Drops a record without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRecord` if no record exists for `id`, or a state
    /// error if the lock cannot be taken or the state cannot be saved.
    pub async fn forget(&self, id: &str) -> Result<StateRecord> {
        let lock = self.store.acquire_lock(&self.holder, "forget").await?;
        let outcome = self.forget_locked(id).await;
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        outcome
    }

    async fn forget_locked(&self, id: &str) -> Result<StateRecord> {
        let mut state = self.load_state().await?;
        let record = state.remove_record(id).ok_or_else(|| {
            DriftlessError::Reconcile(ReconcileError::UnknownRecord { id: id.to_string() })
        })?;
        let config_hash = self.hasher.hash_config(self.config);
        state.add_history(RunHistoryEntry::new(RunOperation::Forget, &config_hash, vec![id.to_string()]));
        self.store.save(&state).await?;
        info!("Forgot '{id}' ({}); the resource itself is untouched", record.physical_id);
        Ok(record)
    }
}

/// Drift status of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Live attributes match the record.
    InSync,
    /// Live attributes differ.
    Drifted {
        /// Recorded value before, live value after.
        changes: Vec<AttributeChange>,
    },
    /// The resource no longer exists.
    Missing,
    /// The provider could not be asked.
    Error {
        /// Error message.
        message: String,
    },
}

/// Drift of one record.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDrift {
    /// Logical id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned id.
    pub physical_id: String,
    /// Status.
    pub status: DriftStatus,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Deployment unit.
    pub unit: String,
    /// One entry per record.
    pub resources: Vec<ResourceDrift>,
    /// Declared ids without a record.
    pub unrecorded: Vec<String>,
    /// Recorded ids no longer declared.
    pub undeclared: Vec<String>,
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.unrecorded.is_empty()
            && self.undeclared.is_empty()
            && self.resources.iter().all(|r| r.status == DriftStatus::InSync)
    }

    /// Records whose live resource differs or is gone.
    #[must_use]
    pub fn drifted(&self) -> Vec<&ResourceDrift> {
        self.resources
            .iter()
            .filter(|r| r.status != DriftStatus::InSync)
            .collect()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - '{}' is converged", self.unit);
        }

        writeln!(f, "Drift detected in '{}':", self.unit)?;
        for resource in self.drifted() {
            match &resource.status {
                DriftStatus::Drifted { changes } => {
                    writeln!(f, "  ~ {} ({})", resource.id, resource.physical_id)?;
                    for change in changes {
                        writeln!(f, "      {change}")?;
                    }
                }
                DriftStatus::Missing => writeln!(f, "  ! {} ({}) no longer exists", resource.id, resource.physical_id)?,
                DriftStatus::Error { message } => writeln!(f, "  ? {}: {message}", resource.id)?,
                DriftStatus::InSync => {}
            }
        }
        for id in &self.unrecorded {
            writeln!(f, "  + {id} is declared but not deployed")?;
        }
        for id in &self.undeclared {
            writeln!(f, "  - {id} is deployed but no longer declared")?;
        }
        Ok(())
    }
}
