//! Graph builder: reference resolution, cycle detection and build order.
//!
//! The builder turns a [`DesiredGraph`] into a [`ValidatedGraph`]:
//!
//! 1. every reference must point at a declared node (`DanglingReference`);
//! 2. the reference graph must be acyclic (`CyclicDependency`), checked by a
//!    depth-first walk with visiting/visited marks;
//! 3. nodes are ordered topologically, ties broken by declaration order.

use std::collections::BTreeSet;
use tracing::debug;

use crate::error::GraphError;

use super::graph::DesiredGraph;
use super::resource::ResourceNode;

/// DFS colour of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// A desired graph whose references and ordering have been checked.
///
/// Immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    /// The underlying graph.
    graph: DesiredGraph,
    /// Node positions in build order.
    order: Vec<usize>,
    /// For each node, the positions it depends on (ascending).
    dependencies: Vec<Vec<usize>>,
    /// For each node, the positions depending on it (ascending).
    dependents: Vec<Vec<usize>>,
    /// Longest dependency chain below each node.
    depth: Vec<usize>,
}

/// Builder validating desired graphs.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a graph and computes its build order.
    ///
    /// # Errors
    ///
    /// Returns `DanglingReference` or `CyclicDependency`.
    pub fn build(&self, graph: DesiredGraph) -> Result<ValidatedGraph, GraphError> {
        let dependencies = Self::resolve_references(&graph)?;
        Self::detect_cycles(&graph, &dependencies)?;

        let mut dependents = vec![Vec::new(); graph.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let (order, depth) = Self::topological_order(&dependencies, &dependents);

        debug!(
            "Validated graph '{}' with {} nodes, max depth {}",
            graph.unit(),
            graph.len(),
            depth.iter().max().copied().unwrap_or(0)
        );

        Ok(ValidatedGraph {
            graph,
            order,
            dependencies,
            dependents,
            depth,
        })
    }

    /// Maps every reference to the position of its target.
    fn resolve_references(graph: &DesiredGraph) -> Result<Vec<Vec<usize>>, GraphError> {
        graph
            .nodes()
            .iter()
            .map(|node| {
                let mut deps = BTreeSet::new();
                for target in node.dependencies() {
                    let pos = graph.position(target).ok_or_else(|| {
                        GraphError::DanglingReference {
                            from: node.id.clone(),
                            target: target.to_string(),
                        }
                    })?;
                    deps.insert(pos);
                }
                Ok(deps.into_iter().collect())
            })
            .collect()
    }

    /// Depth-first cycle detection.
    fn detect_cycles(graph: &DesiredGraph, dependencies: &[Vec<usize>]) -> Result<(), GraphError> {
        let mut marks = vec![Mark::Unvisited; graph.len()];
        let mut path = Vec::new();

        for start in 0..graph.len() {
            if marks[start] == Mark::Unvisited {
                Self::visit(start, dependencies, &mut marks, &mut path).map_err(|cycle| {
                    GraphError::CyclicDependency {
                        cycle: cycle.iter().map(|&i| graph.nodes()[i].id.clone()).collect(),
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Visits one node; on a back edge returns the cycle as positions.
    fn visit(
        node: usize,
        dependencies: &[Vec<usize>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Result<(), Vec<usize>> {
        marks[node] = Mark::Visiting;
        path.push(node);

        for &dep in &dependencies[node] {
            match marks[dep] {
                Mark::Visiting => {
                    // path holds the chain from the first visit of `dep` to `node`
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Err(cycle);
                }
                Mark::Unvisited => Self::visit(dep, dependencies, marks, path)?,
                Mark::Visited => {}
            }
        }

        path.pop();
        marks[node] = Mark::Visited;
        Ok(())
    }

    /// Kahn's algorithm over a ready set ordered by declaration position.
    fn topological_order(
        dependencies: &[Vec<usize>],
        dependents: &[Vec<usize>],
    ) -> (Vec<usize>, Vec<usize>) {
        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut depth = vec![0; dependencies.len()];
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(dependencies.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                depth[dependent] = depth[dependent].max(depth[next] + 1);
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        (order, depth)
    }
}

impl ValidatedGraph {
    /// Returns the underlying graph.
    #[must_use]
    pub const fn graph(&self) -> &DesiredGraph {
        &self.graph
    }

    /// Returns the deployment unit name.
    #[must_use]
    pub fn unit(&self) -> &str {
        self.graph.unit()
    }

    /// Returns the nodes in build order.
    pub fn in_order(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().map(|&i| &self.graph.nodes()[i])
    }

    /// Returns the node ids in build order.
    #[must_use]
    pub fn order_ids(&self) -> Vec<&str> {
        self.in_order().map(|n| n.id.as_str()).collect()
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.graph.get(id)
    }

    /// Returns the ids a node depends on, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.ids_at(self.graph.position(id).map(|p| &self.dependencies[p]))
    }

    /// Returns the ids depending on a node, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.ids_at(self.graph.position(id).map(|p| &self.dependents[p]))
    }

    /// Returns the depth of a node (0 for nodes without dependencies).
    #[must_use]
    pub fn depth_of(&self, id: &str) -> Option<usize> {
        self.graph.position(id).map(|p| self.depth[p])
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    fn ids_at(&self, positions: Option<&Vec<usize>>) -> Vec<&str> {
        positions
            .map(|ps| ps.iter().map(|&i| self.graph.nodes()[i].id.as_str()).collect())
            .unwrap_or_default()
    }
}
