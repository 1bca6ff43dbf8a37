//! The desired resource graph for one deployment unit.

use std::collections::HashMap;

use crate::error::GraphError;

use super::resource::ResourceNode;

/// All nodes declared for one deployment unit, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct DesiredGraph {
    /// Deployment unit name.
    unit: String,
    /// Nodes in declaration order.
    nodes: Vec<ResourceNode>,
    /// Logical id -> position in `nodes`.
    index: HashMap<String, usize>,
}

impl DesiredGraph {
    /// Creates an empty graph for a deployment unit.
    #[must_use]
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Builds a graph from nodes in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` on the first repeated id.
    pub fn from_nodes(
        unit: impl Into<String>,
        nodes: impl IntoIterator<Item = ResourceNode>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new(unit);
        for node in nodes {
            graph.add_node(node)?;
        }
        Ok(graph)
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if a node with the same id already exists.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateId { id: node.id });
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Returns the deployment unit name.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Returns a node by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns the declaration position of a node.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns true if a node with this id exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns the number of nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
