//! Planning module for reconciliation runs.
//!
//! This module compares the desired graph with recorded state, producing a
//! change set, and executes change sets against the providers.

mod diff;
mod plan;
mod executor;

pub use diff::DiffEngine;
pub use plan::{ActionType, ChangeSet, ChangeSummary, Operation};
pub use executor::{
    ExecutionReport, ExecutorOptions, OperationResult, Outcome, PlanExecutor, RunStatus, SkipReason,
};
