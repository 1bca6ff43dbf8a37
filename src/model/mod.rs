//! Resource model and graph builder.
//!
//! This module holds the declared side of a run:
//! - Resource nodes, kinds, attribute values and references
//! - The desired graph for one deployment unit
//! - Validation of the graph into a build order

mod resource;
mod graph;
mod builder;

pub use resource::{AttrValue, Reference, ResolvedAttributes, ResourceKind, ResourceNode};
pub use graph::DesiredGraph;
pub use builder::{GraphBuilder, ValidatedGraph};
