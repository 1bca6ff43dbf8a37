// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Driftless
//!
//! A declarative, idempotent desired-state reconciliation engine for graphs
//! of interdependent cloud resources.
//!
//! ## Overview
//!
//! Driftless lets you:
//!
//! - Declare resources and the references between them in a YAML file
//! - Preview the exact operations a run would perform
//! - Converge live resources towards the declaration, in dependency order
//! - Detect drift between recorded and live attributes
//!
//! ## Architecture
//!
//! 1. **Desired graph**: built from `driftless.yaml` and checked for
//!    duplicates, dangling references and cycles
//! 2. **Recorded state**: the last-applied view of every resource, per
//!    deployment unit
//! 3. **Diff engine**: compares the two and emits an ordered change set
//! 4. **Executor**: runs the change set concurrently with retries, persisting
//!    each confirmed effect before reporting it
//!
//! ## Modules
//!
//! - [`model`]: Resource nodes, references and the graph builder
//! - [`config`]: Declaration parsing, validation and hashing
//! - [`provider`]: Adapter contract, gateway client and per-kind adapters
//! - [`state`]: State storage backends (local, S3) and the run lock
//! - [`planner`]: Diff engine and plan executor
//! - [`reconciler`]: Run orchestration and drift detection
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: prod
//!
//! resources:
//!   - id: app-vpc
//!     kind: network
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - id: main-cluster
//!     kind: cluster
//!     attributes:
//!       network: { ref: app-vpc.id }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DriftlessConfig};
pub use error::{DriftlessError, Result};
pub use model::{DesiredGraph, GraphBuilder, ResourceKind, ResourceNode, ValidatedGraph};
pub use planner::{ChangeSet, DiffEngine, ExecutionReport, PlanExecutor, RunStatus};
pub use provider::{GatewayClient, ProviderAdapter, ProviderRegistry};
pub use reconciler::{DriftReport, Reconciler, RunOutcome};
pub use state::{DeploymentState, LocalStateStore, S3StateStore, StateLedger, StateStore};
