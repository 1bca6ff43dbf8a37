//! Provider boundary.
//!
//! This module provides everything that touches remote resources:
//! - The `ProviderAdapter` capability contract
//! - The gateway HTTP client
//! - Per-kind adapters and the registry mapping kinds to adapters

mod adapter;
mod client;
mod kinds;
mod registry;

#[cfg(test)]
pub(crate) mod fake;

pub use adapter::{
    diff_attributes, AttributeChange, CreateOutcome, Outputs, ProviderAdapter, ProviderResult,
};
#[cfg(test)]
pub use adapter::MockProviderAdapter;
pub use client::{GatewayClient, RemoteResource, DEFAULT_TIMEOUT_SECS};
pub use kinds::{KindAdapter, KindProfile};
pub use registry::ProviderRegistry;
