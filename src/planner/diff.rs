//! Diff engine for comparing the desired graph with recorded state.
//!
//! Forward operations (create, update, replace) are emitted in build order.
//! Deletes follow, in reverse teardown order, so every dependency index in
//! the change set points backwards.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::ConfigHasher;
use crate::model::{Reference, ResourceNode, ValidatedGraph};
use crate::provider::{AttributeChange, ProviderRegistry};
use crate::state::{DeploymentState, StateRecord};

use super::plan::{ActionType, ChangeSet, Operation};

/// Engine for computing change sets.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    /// Source of updatable attribute lists.
    registry: &'a ProviderRegistry,
    /// Attribute hasher.
    hasher: ConfigHasher,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the operations that move `state` to `graph`.
    ///
    /// References are resolved against the outputs recorded by previous
    /// runs. A reference to a node created or replaced in this change set is
    /// known only after apply and always counts as a change.
    #[must_use]
    pub fn compute(&self, graph: &ValidatedGraph, state: &DeploymentState) -> ChangeSet {
        let mut plan = ChangeSet::empty(graph.unit());
        let mut forward: HashMap<&str, usize> = HashMap::new();
        let mut new_outputs: HashSet<&str> = HashSet::new();

        for node in graph.in_order() {
            let dependencies: Vec<usize> = node
                .dependencies()
                .into_iter()
                .filter_map(|d| forward.get(d).copied())
                .collect();
            let lookup = |r: &Reference| {
                if new_outputs.contains(r.target.as_str()) {
                    None
                } else {
                    state.output(r)
                }
            };

            let Some(record) = state.get_record(&node.id) else {
                let delta = Self::full_delta(node, &lookup);
                let index = plan.push(Self::forward_op(
                    node,
                    ActionType::Create,
                    None,
                    dependencies,
                    delta,
                    String::from("declared but not recorded"),
                ));
                debug!("Planned create for '{}'", node.id);
                forward.insert(&node.id, index);
                new_outputs.insert(&node.id);
                continue;
            };

            if record.kind != node.kind {
                let delta = Self::full_delta(node, &lookup);
                let index = plan.push(Self::forward_op(
                    node,
                    ActionType::Replace,
                    Some(&record.physical_id),
                    dependencies,
                    delta,
                    format!("kind changed from {} to {}", record.kind, node.kind),
                ));
                forward.insert(&node.id, index);
                new_outputs.insert(&node.id);
                continue;
            }

            if record.tainted {
                let delta = Self::full_delta(node, &lookup);
                let index = plan.push(Self::forward_op(
                    node,
                    ActionType::Replace,
                    Some(&record.physical_id),
                    dependencies,
                    delta,
                    String::from("never became ready"),
                ));
                warn!("'{}' ({}) never became ready and will be replaced", node.id, record.physical_id);
                forward.insert(&node.id, index);
                new_outputs.insert(&node.id);
                continue;
            }

            let unchanged = node.resolve_attributes(&lookup).is_ok_and(|resolved| {
                ConfigHasher::hashes_match(&self.hasher.hash_attributes(&resolved), &record.attribute_hash)
            });
            if unchanged {
                debug!("'{}' is unchanged", node.id);
                continue;
            }

            let delta = Self::attribute_delta(node, record, &lookup);
            if delta.is_empty() {
                continue;
            }

            let updatable = self
                .registry
                .get(node.kind)
                .map(|adapter| adapter.updatable_attributes())
                .unwrap_or_default();
            let fixed: Vec<&str> = delta
                .iter()
                .filter(|c| !updatable.contains(&c.name))
                .map(|c| c.name.as_str())
                .collect();

            if fixed.is_empty() {
                let reason = format!("{} attribute(s) changed", delta.len());
                let index = plan.push(Self::forward_op(
                    node,
                    ActionType::Update,
                    Some(&record.physical_id),
                    dependencies,
                    delta,
                    reason,
                ));
                forward.insert(&node.id, index);
            } else {
                let reason = format!("{} cannot be updated in place", fixed.join(", "));
                let index = plan.push(Self::forward_op(
                    node,
                    ActionType::Replace,
                    Some(&record.physical_id),
                    dependencies,
                    delta,
                    reason,
                ));
                debug!("Planned replace for '{}'", node.id);
                forward.insert(&node.id, index);
                new_outputs.insert(&node.id);
            }
        }

        Self::plan_deletes(graph, state, &forward, &mut plan);
        plan
    }

    fn forward_op(
        node: &ResourceNode,
        action: ActionType,
        physical_id: Option<&str>,
        dependencies: Vec<usize>,
        delta: Vec<AttributeChange>,
        reason: String,
    ) -> Operation {
        Operation {
            index: 0,
            id: node.id.clone(),
            action,
            kind: node.kind,
            dependencies,
            delta,
            physical_id: physical_id.map(ToString::to_string),
            desired: Some(node.clone()),
            reason,
        }
    }

    /// Every declared attribute as a change from nothing.
    fn full_delta<F>(node: &ResourceNode, lookup: &F) -> Vec<AttributeChange>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        node.attributes
            .iter()
            .map(|(name, value)| match value.resolve(lookup) {
                Some(v) => AttributeChange::new(name.clone(), None, Some(v)),
                None => AttributeChange::known_after_apply(name.clone(), None),
            })
            .collect()
    }

    /// Attribute-by-attribute comparison with the record.
    fn attribute_delta<F>(node: &ResourceNode, record: &StateRecord, lookup: &F) -> Vec<AttributeChange>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        let mut delta = Vec::new();

        for (name, value) in &node.attributes {
            let before = record.attributes.get(name).cloned();
            match value.resolve(lookup) {
                Some(after) if before.as_ref() == Some(&after) => {}
                Some(after) => delta.push(AttributeChange::new(name.clone(), before, Some(after))),
                None => delta.push(AttributeChange::known_after_apply(name.clone(), before)),
            }
        }

        for (name, before) in &record.attributes {
            if !node.attributes.contains_key(name) {
                delta.push(AttributeChange::new(name.clone(), Some(before.clone()), None));
            }
        }

        delta.sort_by(|a, b| a.name.cmp(&b.name));
        delta
    }

    /// Emits deletes for removed nodes, replaced resources and retired ids.
    ///
    /// A physical resource is deleted only after every operation of a node
    /// that referenced it, desired or recorded, has run.
    fn plan_deletes(
        graph: &ValidatedGraph,
        state: &DeploymentState,
        forward: &HashMap<&str, usize>,
        plan: &mut ChangeSet,
    ) {
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for node in graph.in_order() {
            edges.entry(&node.id).or_default().extend(node.dependencies());
        }
        for (id, record) in &state.records {
            edges
                .entry(id.as_str())
                .or_default()
                .extend(record.dependencies.iter().map(String::as_str));
        }
        let known: BTreeSet<&str> = edges.keys().copied().collect();
        for deps in edges.values_mut() {
            deps.retain(|d| known.contains(d));
        }

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (&id, deps) in &edges {
            for &dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut teardown: HashMap<&str, Vec<usize>> = HashMap::new();

        for id in teardown_order(&edges).into_iter().rev() {
            let Some(record) = state.get_record(id) else {
                continue;
            };

            let own_forward = forward.get(id).copied();
            let mut after: Vec<usize> = own_forward.into_iter().collect();
            for dependent in dependents.get(id).into_iter().flatten() {
                after.extend(forward.get(dependent));
                after.extend(teardown.get(dependent).into_iter().flatten());
            }

            let mut own = Vec::new();
            for retired in &record.retired {
                own.push(plan.push(Operation {
                    index: 0,
                    id: id.to_string(),
                    action: ActionType::Delete,
                    kind: retired.kind,
                    dependencies: after.clone(),
                    delta: vec![],
                    physical_id: Some(retired.physical_id.clone()),
                    desired: None,
                    reason: String::from("left over from an earlier replacement"),
                }));
            }

            let replaced = own_forward
                .and_then(|i| plan.get(i))
                .is_some_and(|op| op.action == ActionType::Replace);
            let reason = if graph.node(id).is_none() {
                Some("removed from declaration")
            } else if replaced {
                Some("superseded by its replacement")
            } else {
                None
            };

            if let Some(reason) = reason {
                let mut dependencies = after.clone();
                dependencies.extend(&own);
                debug!("Planned delete of '{id}' ({})", record.physical_id);
                own.push(plan.push(Operation {
                    index: 0,
                    id: id.to_string(),
                    action: ActionType::Delete,
                    kind: record.kind,
                    dependencies,
                    delta: vec![],
                    physical_id: Some(record.physical_id.clone()),
                    desired: None,
                    reason: reason.to_string(),
                }));
            }

            if !own.is_empty() {
                teardown.insert(id, own);
            }
        }
    }
}

/// Topological order over `edges` (node -> its dependencies), dependencies
/// first, ties broken by id.
fn teardown_order<'a>(edges: &BTreeMap<&'a str, BTreeSet<&'a str>>) -> Vec<&'a str> {
    let mut remaining: BTreeMap<&str, usize> = edges.iter().map(|(&id, deps)| (id, deps.len())).collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(id) = ready.pop_first() {
        remaining.remove(id);
        order.push(id);
        for (&other, deps) in edges {
            if !deps.contains(id) {
                continue;
            }
            if let Some(count) = remaining.get_mut(other) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(other);
                }
            }
        }
    }

    if !remaining.is_empty() {
        // Recorded and desired references can disagree in direction.
        warn!(
            "Teardown order has a cycle through: {}",
            remaining.keys().copied().collect::<Vec<_>>().join(", ")
        );
        order.extend(remaining.keys().copied());
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrValue, DesiredGraph, GraphBuilder, ResourceKind};
    use crate::provider::fake::FakeCloud;
    use crate::provider::{KindProfile, Outputs};
    use crate::state::RetiredResource;
    use serde_json::{json, Value};

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

    fn build(nodes: Vec<ResourceNode>) -> ValidatedGraph {
        GraphBuilder::new()
            .build(DesiredGraph::from_nodes("app-dev", nodes).unwrap())
            .unwrap()
    }

    /// Records every node as if it had just been applied.
    fn applied(graph: &ValidatedGraph) -> DeploymentState {
        let mut state = DeploymentState::new("app-dev");
        for (n, node) in graph.in_order().enumerate() {
            let pid = format!("{}-{}", node.kind, n + 1);
            let attributes = node.resolve_attributes(&|r| state.output(r)).unwrap();
            let mut record = StateRecord::new(&node.id, node.kind, &pid);
            record.attribute_hash = ConfigHasher::new().hash_attributes(&attributes);
            record.attributes = attributes;
            record.outputs = KindProfile::of(node.kind)
                .outputs
                .iter()
                .map(|o| {
                    let v = if *o == "id" { Value::from(pid.clone()) } else { Value::from(format!("{pid}.{o}")) };
                    ((*o).to_string(), v)
                })
                .collect::<Outputs>();
            record.dependencies = node.dependencies().into_iter().map(String::from).collect();
            state.set_record(record);
        }
        state
    }

    fn actions(plan: &ChangeSet) -> Vec<(ActionType, &str)> {
        plan.operations.iter().map(|o| (o.action, o.id.as_str())).collect()
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let graph = build(vec![svc(), db(), vpc()]);
        let plan = DiffEngine::new(&registry).compute(&graph, &DeploymentState::new("app-dev"));

        assert_eq!(
            actions(&plan),
            vec![
                (ActionType::Create, "vpc"),
                (ActionType::Create, "db"),
                (ActionType::Create, "svc"),
            ]
        );
        assert_eq!(plan.operations[1].dependencies, vec![0]);
        assert_eq!(plan.operations[2].dependencies, vec![1]);

        let network = plan.operations[1].delta.iter().find(|c| c.name == "network").unwrap();
        assert!(network.known_after_apply);
    }

    #[test]
    fn test_unchanged_graph_is_empty() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let graph = build(vec![vpc(), db(), svc()]);
        let state = applied(&graph);

        assert!(DiffEngine::new(&registry).compute(&graph, &state).is_empty());
    }

    #[test]
    fn test_updatable_change_is_update() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let state = applied(&build(vec![vpc(), db(), svc()]));

        let graph = build(vec![vpc(), db(), svc().with_attribute("desired_count", 4)]);
        let plan = DiffEngine::new(&registry).compute(&graph, &state);

        assert_eq!(actions(&plan), vec![(ActionType::Update, "svc")]);
        let change = &plan.operations[0].delta[0];
        assert_eq!(change.name, "desired_count");
        assert_eq!(change.before, Some(json!(2)));
        assert_eq!(change.after, Some(json!(4)));
        assert_eq!(plan.operations[0].physical_id.as_deref(), Some("container_service-3"));
    }

    #[test]
    fn test_fixed_change_replaces_and_cascades() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let state = applied(&build(vec![vpc(), db(), svc()]));

        let graph = build(vec![vpc(), db().with_attribute("engine_version", "16.1"), svc()]);
        let plan = DiffEngine::new(&registry).compute(&graph, &state);

        // svc only changes database_url, which is not updatable either
        assert_eq!(
            actions(&plan),
            vec![
                (ActionType::Replace, "db"),
                (ActionType::Replace, "svc"),
                (ActionType::Delete, "svc"),
                (ActionType::Delete, "db"),
            ]
        );
        let delete_db = &plan.operations[3];
        assert_eq!(delete_db.physical_id.as_deref(), Some("database-2"));
        assert_eq!(delete_db.dependencies, vec![0, 1, 2]);
        assert_eq!(plan.operations[2].dependencies, vec![1]);
    }

    #[test]
    fn test_replace_delete_waits_for_dependent_update() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let func = ResourceNode::new("fn", ResourceKind::Function)
            .with_attribute("runtime", "python3.12")
            .with_attribute("handler", "main.handler")
            .with_attribute("code", "s3://bucket/fn.zip")
            .with_attribute(
                "environment",
                AttrValue::Map(BTreeMap::from([(
                    String::from("DB_HOST"),
                    AttrValue::reference("db", "endpoint"),
                )])),
            );
        let state = applied(&build(vec![vpc(), db(), func.clone()]));

        let graph = build(vec![vpc(), db().with_attribute("instance_class", "db.t3.large").with_attribute("engine", "mysql"), func]);
        let plan = DiffEngine::new(&registry).compute(&graph, &state);

        assert_eq!(
            actions(&plan),
            vec![
                (ActionType::Replace, "db"),
                (ActionType::Update, "fn"),
                (ActionType::Delete, "db"),
            ]
        );
        assert_eq!(plan.operations[0].reason, "engine cannot be updated in place");
        assert_eq!(plan.operations[2].dependencies, vec![0, 1]);
    }

    #[test]
    fn test_removed_nodes_deleted_in_reverse_order() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let state = applied(&build(vec![vpc(), db(), svc()]));

        let plan = DiffEngine::new(&registry).compute(&build(vec![vpc()]), &state);
        assert_eq!(
            actions(&plan),
            vec![(ActionType::Delete, "svc"), (ActionType::Delete, "db")]
        );
        assert_eq!(plan.operations[1].dependencies, vec![0]);

        let plan = DiffEngine::new(&registry).compute(&build(vec![vpc(), db()]), &state);
        assert_eq!(actions(&plan), vec![(ActionType::Delete, "svc")]);
    }

    #[test]
    fn test_removed_attribute_is_a_change() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let tagged = vpc().with_attribute("tags", AttrValue::Map(BTreeMap::new()));
        let state = applied(&build(vec![tagged]));

        let plan = DiffEngine::new(&registry).compute(&build(vec![vpc()]), &state);
        assert_eq!(actions(&plan), vec![(ActionType::Update, "vpc")]);
        assert_eq!(plan.operations[0].delta[0].after, None);
    }

    #[test]
    fn test_kind_change_replaces() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let state = applied(&build(vec![ResourceNode::new("x", ResourceKind::Secret)]));

        let plan = DiffEngine::new(&registry)
            .compute(&build(vec![ResourceNode::new("x", ResourceKind::Network)]), &state);
        assert_eq!(actions(&plan), vec![(ActionType::Replace, "x"), (ActionType::Delete, "x")]);
        assert_eq!(plan.operations[1].kind, ResourceKind::Secret);
    }

    #[test]
    fn test_retired_ids_are_resumed() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let graph = build(vec![vpc(), db()]);
        let mut state = applied(&graph);
        state.get_record_mut("db").unwrap().retired.push(RetiredResource {
            physical_id: String::from("database-0"),
            kind: ResourceKind::Database,
        });

        let plan = DiffEngine::new(&registry).compute(&graph, &state);
        assert_eq!(actions(&plan), vec![(ActionType::Delete, "db")]);
        assert_eq!(plan.operations[0].physical_id.as_deref(), Some("database-0"));
    }

    #[test]
    fn test_tainted_record_is_replaced() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let graph = build(vec![vpc(), db()]);
        let mut state = applied(&graph);
        state.get_record_mut("db").unwrap().tainted = true;

        let plan = DiffEngine::new(&registry).compute(&graph, &state);
        assert_eq!(actions(&plan), vec![(ActionType::Replace, "db"), (ActionType::Delete, "db")]);
        assert_eq!(plan.operations[1].physical_id.as_deref(), Some("database-2"));
    }

    #[test]
    fn test_identical_inputs_identical_bytes() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let state = applied(&build(vec![vpc(), db(), svc()]));
        let graph = build(vec![vpc().with_attribute("cidr", "10.1.0.0/16"), db()]);

        let first = DiffEngine::new(&registry).compute(&graph, &state).to_json().unwrap();
        let second = DiffEngine::new(&registry).compute(&graph, &state.clone()).to_json().unwrap();
        assert_eq!(first, second);
    }
}
