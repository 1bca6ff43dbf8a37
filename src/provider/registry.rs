//! Adapter registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::GraphError;
use crate::model::{ResourceKind, ValidatedGraph};

use super::adapter::ProviderAdapter;
use super::client::GatewayClient;
use super::kinds::{KindAdapter, KindProfile};

/// Maps each resource kind to its adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ResourceKind, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("ProviderRegistry").field("kinds", &kinds).finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with a gateway adapter for every kind.
    #[must_use]
    pub fn gateway(client: &Arc<GatewayClient>) -> Self {
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(KindAdapter::new(KindProfile::of(kind), Arc::clone(client))));
        }
        registry
    }

    /// Creates a gateway registry with the declaration's readiness settings.
    #[must_use]
    pub fn from_config(client: &Arc<GatewayClient>, config: &ProviderConfig) -> Self {
        let poll_interval = Duration::from_secs(config.poll_interval_secs);
        let ready_timeout = Duration::from_secs(config.ready_timeout_secs);
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            let adapter = KindAdapter::new(KindProfile::of(kind), Arc::clone(client))
                .with_readiness(poll_interval, ready_timeout);
            registry.register(Arc::new(adapter));
        }
        registry
    }

    /// Kinds with a registered adapter, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Registers an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Returns the adapter for a kind.
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Checks that every node has an adapter and every reference names a
    /// declared output.
    ///
    /// # Errors
    ///
    /// Returns `MissingAdapter` or `UnknownOutput`.
    pub fn validate_graph(&self, graph: &ValidatedGraph) -> Result<(), GraphError> {
        for node in graph.in_order() {
            if !self.adapters.contains_key(&node.kind) {
                return Err(GraphError::MissingAdapter {
                    kind: node.kind.to_string(),
                });
            }

            for reference in node.references() {
                let Some(target) = graph.node(&reference.target) else {
                    continue;
                };
                let Some(adapter) = self.adapters.get(&target.kind) else {
                    return Err(GraphError::MissingAdapter {
                        kind: target.kind.to_string(),
                    });
                };
                if !adapter.output_attributes().contains(&reference.output) {
                    return Err(GraphError::UnknownOutput {
                        from: node.id.clone(),
                        target: target.id.clone(),
                        kind: target.kind.to_string(),
                        output: reference.output.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrValue, DesiredGraph, GraphBuilder, ResourceNode};

    fn graph(output: &str) -> ValidatedGraph {
        let nodes = vec![
            ResourceNode::new("vpc", ResourceKind::Network),
            ResourceNode::new("db", ResourceKind::Database)
                .with_attribute("network", AttrValue::reference("vpc", output)),
        ];
        GraphBuilder::new()
            .build(DesiredGraph::from_nodes("t", nodes).unwrap())
            .unwrap()
    }

    #[test]
    fn test_gateway_registry_validates() {
        let client = Arc::new(GatewayClient::new("http://localhost:1", "t").unwrap());
        let registry = ProviderRegistry::gateway(&client);
        assert!(registry.validate_graph(&graph("id")).is_ok());

        let err = registry.validate_graph(&graph("endpoint")).unwrap_err();
        assert!(matches!(err, GraphError::UnknownOutput { ref output, .. } if output == "endpoint"));
    }

    #[test]
    fn test_registry_from_config_covers_every_kind() {
        let client = Arc::new(GatewayClient::new("http://localhost:1", "t").unwrap());
        let registry = ProviderRegistry::from_config(&client, &ProviderConfig::default());
        let mut expected = ResourceKind::ALL.to_vec();
        expected.sort();
        assert_eq!(registry.kinds(), expected);
    }

    #[test]
    fn test_missing_adapter() {
        let err = ProviderRegistry::new().validate_graph(&graph("id")).unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingAdapter {
                kind: String::from("network")
            }
        );
    }
}
