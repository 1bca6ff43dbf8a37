//! Plan executor for applying change sets.
//!
//! Operations run on a bounded pool of tokio tasks. An operation starts once
//! every dependency has succeeded and is skipped as soon as one has failed or
//! been skipped. Each confirmed effect is committed to the state ledger
//! before the operation counts as succeeded. There is no rollback.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ExecutionConfig};
use crate::error::{DriftlessError, ProviderError, ReconcileError, Result};
use crate::model::{ResolvedAttributes, ResourceKind, ResourceNode};
use crate::provider::{ProviderAdapter, ProviderRegistry};
use crate::state::{RetiredResource, StateLedger, StateRecord};

use super::plan::{ActionType, ChangeSet, Operation};

/// Executor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum operations in flight.
    pub concurrency: usize,
    /// Attempts per operation, first call included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the computed backoff.
    pub max_delay: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for ExecutorOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ExecutorOptions {
    /// Delay before retrying after `attempt` failed attempts.
    ///
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`. A provider
    /// requested delay wins when it is longer.
    #[must_use]
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let computed = self.base_delay.saturating_mul(factor).min(self.max_delay);
        retry_after.map_or(computed, |requested| computed.max(requested))
    }
}

/// Why an operation never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A predecessor failed or was skipped.
    DependencyFailed,
    /// The run was stopped before the operation started.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DependencyFailed => f.write_str("dependency failed"),
            Self::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// Final status of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The effect is confirmed and recorded.
    Succeeded,
    /// The operation ran and failed.
    Failed {
        /// Error message.
        reason: String,
    },
    /// The operation never ran.
    Skipped {
        /// Why it was skipped.
        reason: SkipReason,
    },
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// Result of executing a single operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Operation index.
    pub index: usize,
    /// Logical id.
    pub id: String,
    /// Operation action.
    pub action: ActionType,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Final status.
    pub outcome: Outcome,
    /// Provider attempts made.
    pub attempts: u32,
    /// Physical id created or acted on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
}

impl OperationResult {
    fn new(op: &Operation, outcome: Outcome, attempts: u32, physical_id: Option<String>) -> Self {
        Self {
            index: op.index,
            id: op.id.clone(),
            action: op.action,
            kind: op.kind,
            outcome,
            attempts,
            physical_id,
        }
    }

    fn skipped(op: &Operation, reason: SkipReason) -> Self {
        Self::new(op, Outcome::Skipped { reason }, 0, None)
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every operation succeeded.
    Converged,
    /// Some operations succeeded, others failed or were skipped.
    PartiallyConverged,
    /// Nothing succeeded.
    Failed,
}

impl RunStatus {
    /// Process exit code for this status.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Converged => 0,
            Self::PartiallyConverged => 2,
            Self::Failed => 3,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => f.write_str("converged"),
            Self::PartiallyConverged => f.write_str("partially converged"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Result of executing the entire change set.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Deployment unit.
    pub unit: String,
    /// One result per operation, in change-set order.
    pub results: Vec<OperationResult>,
    /// Aggregate status.
    pub status: RunStatus,
    /// Whether cancellation was requested.
    pub cancelled: bool,
    /// Set when the run stopped because state could not be saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
}

impl ExecutionReport {
    fn new(unit: &str, results: Vec<OperationResult>, cancelled: bool, halted: Option<String>) -> Self {
        let succeeded = results.iter().filter(|r| r.outcome == Outcome::Succeeded).count();
        let status = if succeeded == results.len() {
            RunStatus::Converged
        } else if succeeded > 0 {
            RunStatus::PartiallyConverged
        } else {
            RunStatus::Failed
        };

        Self {
            unit: unit.to_string(),
            results,
            status,
            cancelled,
            halted,
        }
    }

    /// Number of successful operations.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome == Outcome::Succeeded).count()
    }

    /// Number of failed operations.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
            .count()
    }

    /// Number of skipped operations.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Skipped { .. }))
            .count()
    }

    /// Process exit code for the run.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// One-line summary for history entries, `None` when converged.
    #[must_use]
    pub fn failure_summary(&self) -> Option<String> {
        if self.status == RunStatus::Converged {
            return None;
        }
        let mut summary = format!("{} failed, {} skipped", self.failed(), self.skipped());
        if let Some(reason) = &self.halted {
            summary.push_str(&format!(" (halted: {reason})"));
        } else if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        Some(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Output of one operation task.
struct Finished {
    result: OperationResult,
    /// Set when the run must stop dequeuing.
    halt: Option<String>,
}

/// Executor for change sets.
#[derive(Debug)]
pub struct PlanExecutor {
    /// Adapters by kind.
    registry: ProviderRegistry,
    /// Incrementally persisted state.
    ledger: Arc<StateLedger>,
    /// Tuning.
    options: ExecutorOptions,
    /// Cancellation signal; `true` stops dequeuing.
    cancel: Option<watch::Receiver<bool>>,
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(registry: ProviderRegistry, ledger: Arc<StateLedger>) -> Self {
        Self {
            registry,
            ledger,
            options: ExecutorOptions::default(),
            cancel: None,
        }
    }

    /// Sets the executor options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Stops starting operations once `cancel` turns `true`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Executes a change set.
    ///
    /// Operation errors are captured in the report and never returned.
    pub async fn execute(&self, plan: &ChangeSet) -> ExecutionReport {
        let total = plan.len();
        info!("Executing change set for '{}' with {total} operations", plan.unit);

        let mut slots = vec![Slot::Pending; total];
        let mut results: Vec<Option<OperationResult>> = (0..total).map(|_| None).collect();
        let mut running: JoinSet<Finished> = JoinSet::new();

        let mut cancel = self.cancel.clone();
        let mut watching = cancel.is_some();
        let mut cancelled = cancel.as_ref().is_some_and(|rx| *rx.borrow());
        let mut halted: Option<String> = None;

        loop {
            Self::skip_blocked(plan, &mut slots, &mut results);

            if !cancelled && halted.is_none() {
                for op in &plan.operations {
                    if running.len() >= self.options.concurrency {
                        break;
                    }
                    let ready = slots.get(op.index) == Some(&Slot::Pending)
                        && op
                            .dependencies
                            .iter()
                            .all(|&d| slots.get(d) == Some(&Slot::Succeeded));
                    if ready {
                        debug!("Starting operation {op}");
                        slots[op.index] = Slot::Running;
                        running.spawn(run_operation(
                            op.clone(),
                            self.registry.get(op.kind),
                            Arc::clone(&self.ledger),
                            self.options.clone(),
                        ));
                    }
                }
            }

            if running.is_empty() {
                break;
            }

            let joined = if let Some(rx) = cancel.as_mut().filter(|_| watching) {
                let in_flight = running.len();
                tokio::select! {
                    joined = running.join_next() => joined,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            watching = false;
                        } else if *rx.borrow_and_update() && !cancelled {
                            warn!("Cancellation requested, waiting for {in_flight} in-flight operation(s)");
                            cancelled = true;
                        }
                        continue;
                    }
                }
            } else {
                running.join_next().await
            };

            match joined {
                Some(Ok(finished)) => {
                    let index = finished.result.index;
                    slots[index] = if finished.result.outcome == Outcome::Succeeded {
                        Slot::Succeeded
                    } else {
                        Slot::Failed
                    };
                    if let Some(reason) = finished.halt {
                        error!("Stopping run: {reason}");
                        halted.get_or_insert(reason);
                    }
                    results[index] = Some(finished.result);
                }
                Some(Err(e)) => error!("Operation task aborted: {e}"),
                None => break,
            }
        }

        let stopped = cancelled || halted.is_some();
        let results = plan
            .operations
            .iter()
            .zip(results)
            .map(|(op, result)| {
                result.unwrap_or_else(|| match slots[op.index] {
                    Slot::Running => OperationResult::new(
                        op,
                        Outcome::Failed {
                            reason: String::from("operation task aborted"),
                        },
                        0,
                        None,
                    ),
                    _ if stopped => OperationResult::skipped(op, SkipReason::Cancelled),
                    _ => OperationResult::skipped(op, SkipReason::DependencyFailed),
                })
            })
            .collect();

        let report = ExecutionReport::new(&plan.unit, results, cancelled, halted);
        info!(
            "Run {}: {} succeeded, {} failed, {} skipped",
            report.status,
            report.succeeded(),
            report.failed(),
            report.skipped()
        );
        report
    }

    /// Marks pending operations behind a failed or skipped one as skipped.
    fn skip_blocked(plan: &ChangeSet, slots: &mut [Slot], results: &mut [Option<OperationResult>]) {
        let mut changed = true;
        while changed {
            changed = false;
            for op in &plan.operations {
                if slots[op.index] != Slot::Pending {
                    continue;
                }
                let blocked = op
                    .dependencies
                    .iter()
                    .any(|&d| matches!(slots.get(d), Some(Slot::Failed | Slot::Skipped)));
                if blocked {
                    warn!("Skipping {op}: a dependency did not succeed");
                    slots[op.index] = Slot::Skipped;
                    results[op.index] = Some(OperationResult::skipped(op, SkipReason::DependencyFailed));
                    changed = true;
                }
            }
        }
    }
}

/// Runs one operation with retries.
async fn run_operation(
    op: Operation,
    adapter: Option<Arc<dyn ProviderAdapter>>,
    ledger: Arc<StateLedger>,
    options: ExecutorOptions,
) -> Finished {
    let Some(adapter) = adapter else {
        let e = ReconcileError::NoAdapter {
            kind: op.kind.to_string(),
        };
        error!("{op} failed: {e}");
        return Finished {
            result: OperationResult::new(&op, Outcome::Failed { reason: e.to_string() }, 0, None),
            halt: None,
        };
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        match apply_once(&op, adapter.as_ref(), &ledger).await {
            Ok(physical_id) => {
                info!("{op} succeeded");
                return Finished {
                    result: OperationResult::new(&op, Outcome::Succeeded, attempts, Some(physical_id)),
                    halt: None,
                };
            }
            Err(DriftlessError::Provider(e)) if e.is_transient() && attempts < options.max_attempts => {
                let delay = options.backoff(attempts, e.retry_after());
                warn!(
                    "{op} failed ({e}), retrying in {delay:?} (attempt {attempts}/{})",
                    options.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("{op} failed after {attempts} attempt(s): {e}");
                let halt = matches!(e, DriftlessError::State(_)).then(|| e.to_string());
                return Finished {
                    result: OperationResult::new(
                        &op,
                        Outcome::Failed { reason: e.to_string() },
                        attempts,
                        None,
                    ),
                    halt,
                };
            }
        }
    }
}

/// One attempt: provider call, then ledger commit.
async fn apply_once(op: &Operation, adapter: &dyn ProviderAdapter, ledger: &StateLedger) -> Result<String> {
    match op.action {
        ActionType::Create | ActionType::Replace => {
            let node = desired_node(op)?;
            let attributes = resolve(node, ledger).await?;
            let created = match adapter.create(&attributes).await {
                Ok(created) => created,
                Err(e) => {
                    if let Some(physical_id) = e.unready_resource() {
                        record_unready(node, physical_id, attributes, ledger).await?;
                    }
                    return Err(e.into());
                }
            };
            let physical_id = created.physical_id.clone();
            let hash = ConfigHasher::new().hash_attributes(&attributes);

            ledger
                .commit(&op.id, move |state| {
                    let mut record = StateRecord::new(&node.id, node.kind, &created.physical_id);
                    if let Some(previous) = state.get_record(&node.id) {
                        record.retired.clone_from(&previous.retired);
                        record.created_at = previous.created_at;
                        if previous.physical_id != created.physical_id {
                            record.retired.push(RetiredResource {
                                physical_id: previous.physical_id.clone(),
                                kind: previous.kind,
                            });
                        }
                    }
                    record.attributes = attributes;
                    record.outputs = created.outputs;
                    record.attribute_hash = hash;
                    record.dependencies = node.dependencies().into_iter().map(String::from).collect();
                    state.set_record(record);
                })
                .await?;
            Ok(physical_id)
        }
        ActionType::Update => {
            let node = desired_node(op)?;
            let physical_id = operation_target(op)?;
            let attributes = resolve(node, ledger).await?;
            let recorded = ledger
                .read(|state| state.get_record(&op.id).map(|r| r.attributes.clone()))
                .await
                .ok_or_else(|| ReconcileError::UnknownRecord { id: op.id.clone() })?;

            let delta = update_delta(&recorded, &attributes);
            let outputs = if delta.is_empty() {
                None
            } else {
                Some(adapter.update(physical_id, &delta).await?)
            };
            let hash = ConfigHasher::new().hash_attributes(&attributes);

            ledger
                .commit(&op.id, move |state| {
                    if let Some(record) = state.get_record_mut(&op.id) {
                        record.attributes = attributes;
                        if let Some(outputs) = outputs.filter(|o| !o.is_empty()) {
                            record.outputs = outputs;
                        }
                        record.attribute_hash = hash;
                        record.dependencies = node.dependencies().into_iter().map(String::from).collect();
                        record.touch();
                    }
                })
                .await?;
            Ok(physical_id.to_string())
        }
        ActionType::Delete => {
            let physical_id = operation_target(op)?;
            match adapter.delete(physical_id).await {
                Ok(()) => {}
                Err(ProviderError::NotFound { .. }) => {
                    info!("'{physical_id}' of '{}' was already gone", op.id);
                }
                Err(e) => return Err(e.into()),
            }

            ledger
                .commit(&op.id, |state| {
                    let current = state
                        .get_record(&op.id)
                        .is_some_and(|r| r.physical_id == physical_id);
                    if current {
                        state.remove_record(&op.id);
                    } else if let Some(record) = state.get_record_mut(&op.id) {
                        record.retired.retain(|r| r.physical_id != physical_id);
                        record.touch();
                    }
                })
                .await?;
            Ok(physical_id.to_string())
        }
    }
}

/// Records a resource that exists but never became ready so the next plan
/// cleans it up instead of creating another one.
///
/// A live record gets the id as retired. Without a record, the id is recorded
/// as a tainted record, which the next plan replaces.
async fn record_unready(
    node: &ResourceNode,
    physical_id: &str,
    attributes: ResolvedAttributes,
    ledger: &StateLedger,
) -> Result<()> {
    warn!("'{}' left {} {physical_id} behind, recording it", node.id, node.kind);
    ledger
        .commit(&node.id, |state| {
            if let Some(record) = state.get_record_mut(&node.id) {
                record.retired.push(RetiredResource {
                    physical_id: physical_id.to_string(),
                    kind: node.kind,
                });
                record.touch();
            } else {
                let mut record = StateRecord::new(&node.id, node.kind, physical_id);
                record.attributes = attributes;
                record.dependencies = node.dependencies().into_iter().map(String::from).collect();
                record.tainted = true;
                state.set_record(record);
            }
        })
        .await
}

fn desired_node(op: &Operation) -> Result<&ResourceNode> {
    op.desired
        .as_ref()
        .ok_or_else(|| DriftlessError::internal(format!("{op} has no desired node")))
}

fn operation_target(op: &Operation) -> Result<&str> {
    op.physical_id
        .as_deref()
        .ok_or_else(|| DriftlessError::internal(format!("{op} has no physical id")))
}

/// Resolves references against outputs recorded so far.
async fn resolve(node: &ResourceNode, ledger: &StateLedger) -> Result<ResolvedAttributes> {
    ledger
        .read(|state| node.resolve_attributes(&|r| state.output(r)))
        .await
        .map_err(|attributes| {
            DriftlessError::Reconcile(ReconcileError::UnresolvedReference {
                id: node.id.clone(),
                attributes,
            })
        })
}

/// Changed attributes, with removed ones set to `null`.
fn update_delta(recorded: &ResolvedAttributes, desired: &ResolvedAttributes) -> ResolvedAttributes {
    let changed = desired
        .iter()
        .filter(|(name, value)| recorded.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()));
    let removed = recorded
        .keys()
        .filter(|name| !desired.contains_key(*name))
        .map(|name| (name.clone(), Value::Null));
    changed.chain(removed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrValue, DesiredGraph, GraphBuilder, ValidatedGraph};
    use crate::planner::DiffEngine;
    use crate::provider::fake::{Call, FakeCloud};
    use crate::provider::{CreateOutcome, MockProviderAdapter, Outputs};
    use crate::state::{DeploymentState, LocalStateStore, StateStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn vpc() -> ResourceNode {
        ResourceNode::new("vpc", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16")
    }

    fn db() -> ResourceNode {
        ResourceNode::new("db", ResourceKind::Database)
            .with_attribute("engine", "postgres")
            .with_attribute("engine_version", "15.3")
            .with_attribute("instance_class", "db.t3.micro")
            .with_attribute("network", AttrValue::reference("vpc", "id"))
    }

    fn svc() -> ResourceNode {
        ResourceNode::new("svc", ResourceKind::ContainerService)
            .with_attribute("cluster", "main")
            .with_attribute("task_definition", "app:1")
            .with_attribute("desired_count", 2)
            .with_attribute("database_url", AttrValue::reference("db", "endpoint"))
    }

    fn secret(id: &str) -> ResourceNode {
        ResourceNode::new(id, ResourceKind::Secret).with_attribute("description", id)
    }

    fn build(nodes: Vec<ResourceNode>) -> ValidatedGraph {
        GraphBuilder::new()
            .build(DesiredGraph::from_nodes("app-dev", nodes).unwrap())
            .unwrap()
    }

    fn fast() -> ExecutorOptions {
        ExecutorOptions {
            concurrency: 5,
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    struct Harness {
        _temp: TempDir,
        cloud: Arc<FakeCloud>,
        store: Arc<dyn StateStore>,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new(temp.path(), "app-dev"));
            Self {
                _temp: temp,
                cloud: FakeCloud::new(),
                store,
            }
        }

        async fn state(&self) -> DeploymentState {
            self.store
                .load()
                .await
                .unwrap()
                .unwrap_or_else(|| DeploymentState::new("app-dev"))
        }

        async fn plan(&self, nodes: Vec<ResourceNode>) -> ChangeSet {
            let registry = self.cloud.registry();
            DiffEngine::new(&registry).compute(&build(nodes), &self.state().await)
        }

        async fn execute(&self, plan: &ChangeSet, executor: impl FnOnce(PlanExecutor) -> PlanExecutor) -> ExecutionReport {
            let ledger = Arc::new(StateLedger::new(Arc::clone(&self.store), self.state().await));
            executor(PlanExecutor::new(self.cloud.registry(), ledger).with_options(fast()))
                .execute(plan)
                .await
        }

        async fn apply(&self, nodes: Vec<ResourceNode>) -> (ChangeSet, ExecutionReport) {
            let plan = self.plan(nodes).await;
            let report = self.execute(&plan, |e| e).await;
            (plan, report)
        }
    }

    #[test]
    fn test_backoff() {
        let options = ExecutorOptions {
            concurrency: 1,
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(options.backoff(1, None), Duration::from_millis(500));
        assert_eq!(options.backoff(2, None), Duration::from_millis(1000));
        assert_eq!(options.backoff(3, None), Duration::from_millis(2000));
        assert_eq!(options.backoff(4, None), Duration::from_secs(3));
        assert_eq!(options.backoff(1, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(options.backoff(40, None), Duration::from_secs(3));
    }

    #[test]
    fn test_update_delta_nulls_removed() {
        let recorded: ResolvedAttributes = [
            (String::from("a"), Value::from(1)),
            (String::from("b"), Value::from(2)),
        ]
        .into();
        let desired: ResolvedAttributes = [
            (String::from("a"), Value::from(1)),
            (String::from("c"), Value::from(3)),
        ]
        .into();
        let delta = update_delta(&recorded, &desired);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["b"], Value::Null);
        assert_eq!(delta["c"], Value::from(3));
    }

    #[tokio::test]
    async fn test_create_update_remove_lifecycle() {
        let h = Harness::new();

        let (plan, report) = h.apply(vec![vpc(), db(), svc()]).await;
        let created: Vec<_> = plan.operations.iter().map(|o| (o.action, o.id.as_str())).collect();
        assert_eq!(
            created,
            vec![
                (ActionType::Create, "vpc"),
                (ActionType::Create, "db"),
                (ActionType::Create, "svc"),
            ]
        );
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(report.exit_code(), 0);

        let state = h.state().await;
        assert_eq!(state.records.len(), 3);
        assert_eq!(state.get_record("vpc").unwrap().physical_id, "network-1");
        assert_eq!(
            state.get_record("db").unwrap().attributes["network"],
            Value::from("network-1")
        );
        assert_eq!(
            state.get_record("svc").unwrap().attributes["database_url"],
            Value::from("database-2.endpoint")
        );

        // second run with the same declaration does nothing
        assert!(h.plan(vec![vpc(), db(), svc()]).await.is_empty());

        let (plan, report) = h.apply(vec![vpc(), db()]).await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.operations[0].action, ActionType::Delete);
        assert_eq!(plan.operations[0].id, "svc");
        assert_eq!(report.status, RunStatus::Converged);

        let state = h.state().await;
        assert!(state.get_record("svc").is_none());
        assert_eq!(state.get_record("vpc").unwrap().physical_id, "network-1");
        assert_eq!(state.get_record("db").unwrap().physical_id, "database-2");
        assert_eq!(h.cloud.live().len(), 2);
    }

    #[tokio::test]
    async fn test_dependencies_finish_before_dependents_start() {
        let h = Harness::new();
        h.cloud.set_delay(Duration::from_millis(10));

        let (_, report) = h.apply(vec![svc(), secret("a"), db(), secret("b"), vpc()]).await;
        assert_eq!(report.status, RunStatus::Converged);

        // ids depend on completion order, so match on the kind prefix
        let log = h.cloud.log();
        let position = |kind: &str| {
            log.iter()
                .position(|l| l.starts_with(&format!("create {kind}-")))
                .unwrap()
        };
        assert!(position("network") < position("database"));
        assert!(position("database") < position("container_service"));
    }

    #[tokio::test]
    async fn test_replace_deletes_old_after_dependents_move() {
        let h = Harness::new();
        h.apply(vec![vpc(), db(), svc()]).await;

        let changed = db().with_attribute("engine_version", "16.1");
        let (plan, report) = h.apply(vec![vpc(), changed.clone(), svc()]).await;

        // the fake refuses to delete database-2 while svc still points at it
        assert_eq!(report.status, RunStatus::Converged, "{report:?}");
        assert_eq!(plan.summary().replaces, 2);
        assert_eq!(h.cloud.live_of_kind(ResourceKind::Database), vec!["database-4"]);

        let state = h.state().await;
        let db_record = state.get_record("db").unwrap();
        assert_eq!(db_record.physical_id, "database-4");
        assert!(db_record.retired.is_empty());
        assert_eq!(
            state.get_record("svc").unwrap().attributes["database_url"],
            Value::from("database-4.endpoint")
        );

        assert!(h.plan(vec![vpc(), changed, svc()]).await.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_replace_resumes_delete() {
        let h = Harness::new();
        h.apply(vec![vpc(), db(), svc()]).await;
        h.cloud.fail(
            ResourceKind::Database,
            Call::Delete,
            ProviderError::InvalidRequest {
                message: String::from("maintenance window"),
            },
            Some(1),
        );

        let changed = db().with_attribute("engine_version", "16.1");
        let (_, report) = h.apply(vec![vpc(), changed.clone(), svc()]).await;
        assert_eq!(report.status, RunStatus::PartiallyConverged);
        assert_eq!(report.exit_code(), 2);
        let retired = h.state().await.get_record("db").unwrap().retired.clone();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].physical_id, "database-2");

        let (plan, report) = h.apply(vec![vpc(), changed, svc()]).await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.operations[0].physical_id.as_deref(), Some("database-2"));
        assert_eq!(report.status, RunStatus::Converged);
        assert!(h.state().await.get_record("db").unwrap().retired.is_empty());
    }

    #[tokio::test]
    async fn test_failure_contained_to_dependents() {
        let h = Harness::new();
        h.cloud.fail(
            ResourceKind::Database,
            Call::Create,
            ProviderError::InvalidRequest {
                message: String::from("bad instance class"),
            },
            None,
        );

        let (plan, report) = h.apply(vec![vpc(), db(), svc(), secret("api-key")]).await;
        let outcome = |id: &str| {
            let index = plan.operations.iter().position(|o| o.id == id).unwrap();
            report.results[index].outcome.clone()
        };

        assert_eq!(outcome("vpc"), Outcome::Succeeded);
        assert!(matches!(outcome("db"), Outcome::Failed { .. }));
        assert_eq!(
            outcome("svc"),
            Outcome::Skipped {
                reason: SkipReason::DependencyFailed
            }
        );
        assert_eq!(outcome("api-key"), Outcome::Succeeded);
        assert_eq!(report.status, RunStatus::PartiallyConverged);

        let state = h.state().await;
        assert_eq!(state.record_ids(), vec!["api-key", "vpc"]);
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let h = Harness::new();
        h.cloud.fail(
            ResourceKind::Network,
            Call::Create,
            ProviderError::RateLimited { retry_after_secs: 0 },
            Some(2),
        );

        let (_, report) = h.apply(vec![vpc()]).await;
        assert_eq!(report.results[0].outcome, Outcome::Succeeded);
        assert_eq!(report.results[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_bounded() {
        let h = Harness::new();
        h.cloud.fail(
            ResourceKind::Network,
            Call::Create,
            ProviderError::NotYetVisible {
                message: String::from("subnet"),
            },
            None,
        );

        let (_, report) = h.apply(vec![vpc()]).await;
        assert!(matches!(report.results[0].outcome, Outcome::Failed { .. }));
        assert_eq!(report.results[0].attempts, 3);
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mock = MockProviderAdapter::new();
        mock.expect_kind().return_const(ResourceKind::Secret);
        let counter = Arc::clone(&calls);
        mock.expect_create().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Unsupported {
                attributes: vec![String::from("kms_key")],
            })
        });
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock));

        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new(temp.path(), "app-dev"));
        let plan = DiffEngine::new(&registry).compute(&build(vec![secret("s")]), &DeploymentState::new("app-dev"));
        let ledger = Arc::new(StateLedger::new(store, DeploymentState::new("app-dev")));
        let report = PlanExecutor::new(registry, ledger)
            .with_options(fast())
            .execute(&plan)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.results[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_network_error_then_success_with_mock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mock = MockProviderAdapter::new();
        mock.expect_kind().return_const(ResourceKind::Secret);
        let counter = Arc::clone(&calls);
        mock.expect_create().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::network("connection reset"))
            } else {
                Ok(CreateOutcome {
                    physical_id: String::from("secret-9"),
                    outputs: Outputs::from([(String::from("arn"), Value::from("arn:secret-9"))]),
                })
            }
        });
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock));

        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new(temp.path(), "app-dev"));
        let plan = DiffEngine::new(&registry).compute(&build(vec![secret("s")]), &DeploymentState::new("app-dev"));
        let ledger = Arc::new(StateLedger::new(Arc::clone(&store), DeploymentState::new("app-dev")));
        let report = PlanExecutor::new(registry, ledger)
            .with_options(fast())
            .execute(&plan)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(report.results[0].physical_id.as_deref(), Some("secret-9"));
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.get_record("s").unwrap().outputs["arn"], Value::from("arn:secret-9"));
    }

    #[tokio::test]
    async fn test_unready_resource_replaced_not_duplicated() {
        let creates = Arc::new(AtomicUsize::new(0));
        let mut mock = MockProviderAdapter::new();
        mock.expect_kind().return_const(ResourceKind::Secret);
        let counter = Arc::clone(&creates);
        mock.expect_create().times(2).returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                Err(ProviderError::Timeout {
                    physical_id: String::from("secret-1"),
                    expected_state: String::from("available"),
                })
            } else {
                Ok(CreateOutcome {
                    physical_id: format!("secret-{n}"),
                    outputs: Outputs::new(),
                })
            }
        });
        mock.expect_delete()
            .withf(|physical_id| physical_id.to_string() == "secret-1")
            .times(1)
            .returning(|_| Ok(()));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock));

        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new(temp.path(), "app-dev"));
        let graph = build(vec![secret("s")]);
        let run = |state: DeploymentState| {
            let plan = DiffEngine::new(&registry).compute(&graph, &state);
            let ledger = Arc::new(StateLedger::new(Arc::clone(&store), state));
            let executor = PlanExecutor::new(registry.clone(), ledger).with_options(fast());
            async move { (executor.execute(&plan).await, plan) }
        };

        let (report, _) = run(DeploymentState::new("app-dev")).await;
        assert_eq!(report.results[0].attempts, 1);
        assert_eq!(report.status, RunStatus::Failed);
        let state = store.load().await.unwrap().unwrap();
        let record = state.get_record("s").unwrap();
        assert_eq!(record.physical_id, "secret-1");
        assert!(record.tainted);

        let (report, plan) = run(state).await;
        let planned: Vec<_> = plan
            .operations
            .iter()
            .map(|o| (o.action, o.physical_id.as_deref()))
            .collect();
        assert_eq!(
            planned,
            vec![(ActionType::Replace, Some("secret-1")), (ActionType::Delete, Some("secret-1"))]
        );
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(creates.load(Ordering::SeqCst), 2);

        let state = store.load().await.unwrap().unwrap();
        let record = state.get_record("s").unwrap();
        assert_eq!(record.physical_id, "secret-2");
        assert!(!record.tainted);
        assert!(record.retired.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let h = Harness::new();
        h.cloud.set_delay(Duration::from_millis(20));
        let nodes: Vec<_> = (0..8).map(|i| secret(&format!("s{i}"))).collect();

        let plan = h.plan(nodes).await;
        let report = h
            .execute(&plan, |e| {
                e.with_options(ExecutorOptions {
                    concurrency: 3,
                    ..fast()
                })
            })
            .await;

        assert_eq!(report.status, RunStatus::Converged);
        assert!(h.cloud.max_in_flight() <= 3);
        assert!(h.cloud.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let h = Harness::new();
        let (tx, rx) = watch::channel(true);

        let plan = h.plan(vec![vpc(), secret("a")]).await;
        let report = h.execute(&plan, |e| e.with_cancellation(rx)).await;
        drop(tx);

        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
        assert!(report.results.iter().all(|r| r.outcome
            == Outcome::Skipped {
                reason: SkipReason::Cancelled
            }));
        assert_eq!(h.cloud.mutations(), 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_finish() {
        let h = Harness::new();
        h.cloud.set_delay(Duration::from_millis(100));
        let (tx, rx) = watch::channel(false);

        let plan = h.plan(vec![secret("a"), secret("b")]).await;
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });
        let report = h
            .execute(&plan, |e| {
                e.with_options(ExecutorOptions {
                    concurrency: 1,
                    ..fast()
                })
                .with_cancellation(rx)
            })
            .await;
        drop(cancel.await.unwrap());

        assert_eq!(report.results[0].outcome, Outcome::Succeeded);
        assert_eq!(
            report.results[1].outcome,
            Outcome::Skipped {
                reason: SkipReason::Cancelled
            }
        );
        assert_eq!(h.state().await.record_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_resource_succeeds() {
        let h = Harness::new();
        h.apply(vec![vpc(), secret("old")]).await;
        let pid = h.state().await.get_record("old").unwrap().physical_id.clone();

        // removed out of band
        let registry = h.cloud.registry();
        registry.get(ResourceKind::Secret).unwrap().delete(&pid).await.unwrap();

        let (_, report) = h.apply(vec![vpc()]).await;
        assert_eq!(report.status, RunStatus::Converged);
        assert!(h.state().await.get_record("old").is_none());
    }

    #[tokio::test]
    async fn test_empty_plan_converges() {
        let h = Harness::new();
        let report = h.execute(&ChangeSet::empty("app-dev"), |e| e).await;
        assert_eq!(report.status, RunStatus::Converged);
        assert!(report.results.is_empty());
    }
}
