//! State management module for the driftless engine.
//!
//! This module provides persistent storage of last-applied records per
//! deployment unit, the advisory run lock, and the ledger the executor uses
//! to persist each confirmed operation.

mod store;
mod local;
mod s3;
mod lock;
mod ledger;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS};
pub use ledger::StateLedger;
pub use types::{DeploymentState, RunHistoryEntry, RetiredResource, RunOperation, StateRecord, STATE_VERSION};
