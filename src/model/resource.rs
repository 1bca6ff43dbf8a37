//! Resource nodes, kinds and attribute values.
//!
//! A node's attributes are either literal values or references to another
//! node's computed output. References are kept unresolved until the
//! referenced node's outputs are known.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Kinds of resources the engine knows how to reconcile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network.
    Network,
    /// Container cluster.
    Cluster,
    /// Managed secret.
    Secret,
    /// Managed relational database.
    Database,
    /// Container task definition.
    ContainerTaskDefinition,
    /// Long-running container service.
    ContainerService,
    /// Serverless function.
    Function,
    /// Time-based trigger pointing at a function.
    ScheduleRule,
}

impl ResourceKind {
    /// Every kind, in a fixed order.
    pub const ALL: [Self; 8] = [
        Self::Network,
        Self::Cluster,
        Self::Secret,
        Self::Database,
        Self::ContainerTaskDefinition,
        Self::ContainerService,
        Self::Function,
        Self::ScheduleRule,
    ];

    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::Secret => "secret",
            Self::Database => "database",
            Self::ContainerTaskDefinition => "container_task_definition",
            Self::ContainerService => "container_service",
            Self::Function => "function",
            Self::ScheduleRule => "schedule_rule",
        }
    }

    /// Attributes that must be declared for this kind.
    #[must_use]
    pub const fn required_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Network | Self::Secret => &[],
            Self::Cluster => &["network"],
            Self::Database => &["engine", "engine_version", "instance_class", "network"],
            Self::ContainerTaskDefinition => &["image", "cpu", "memory_mib"],
            Self::ContainerService => &["cluster", "task_definition", "desired_count"],
            Self::Function => &["runtime", "handler", "code"],
            Self::ScheduleRule => &["schedule", "target"],
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer from an attribute to another node's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ReferenceRepr", into = "ReferenceRepr")]
pub struct Reference {
    /// Logical id of the referenced node.
    pub target: String,
    /// Output attribute of the referenced node.
    pub output: String,
}

/// On-disk form of a reference: `{ ref: "<node>.<output>" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceRepr {
    #[serde(rename = "ref")]
    reference: String,
}

impl Reference {
    /// Creates a reference to `target`'s `output`.
    #[must_use]
    pub fn new(target: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            output: output.into(),
        }
    }

    /// Parses a `node.output` reference.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is missing.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('.') {
            Some((target, output)) if !target.is_empty() && !output.is_empty() => {
                Ok(Self::new(target, output))
            }
            _ => Err(format!("Invalid reference '{s}'. Expected format: <resource>.<output>")),
        }
    }
}

impl TryFrom<ReferenceRepr> for Reference {
    type Error = String;

    fn try_from(repr: ReferenceRepr) -> Result<Self, Self::Error> {
        Self::parse(&repr.reference)
    }
}

impl From<Reference> for ReferenceRepr {
    fn from(reference: Reference) -> Self {
        Self {
            reference: reference.to_string(),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.target, self.output)
    }
}

/// A declared attribute value: literal, reference, or a nesting of both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Reference to another node's output.
    Reference(Reference),
    /// List of values.
    List(Vec<AttrValue>),
    /// Map of values.
    Map(BTreeMap<String, AttrValue>),
    /// Scalar literal.
    Literal(Value),
}

impl AttrValue {
    /// Creates a reference value.
    #[must_use]
    pub fn reference(target: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Reference(Reference::new(target, output))
    }

    /// Returns the value as a string literal, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Literal(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a reference, if it is one.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Collects every reference contained in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
            Self::Literal(_) => {}
        }
    }

    /// Collects every string literal contained in this value.
    #[must_use]
    pub fn string_literals(&self) -> Vec<&str> {
        match self {
            Self::Literal(Value::String(s)) => vec![s.as_str()],
            Self::List(items) => items.iter().flat_map(Self::string_literals).collect(),
            Self::Map(entries) => entries.values().flat_map(Self::string_literals).collect(),
            Self::Reference(_) | Self::Literal(_) => vec![],
        }
    }

    /// Substitutes references using `lookup`.
    ///
    /// Returns `None` if any reference cannot be resolved yet.
    pub fn resolve<F>(&self, lookup: &F) -> Option<Value>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Reference(r) => lookup(r),
            Self::Literal(v) => Some(v.clone()),
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|r| (k.clone(), r)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Value::Object),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Literal(Value::String(s.to_string()))
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Literal(Value::String(s))
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Literal(Value::Bool(b))
    }
}

impl From<Reference> for AttrValue {
    fn from(r: Reference) -> Self {
        Self::Reference(r)
    }
}

/// A single declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Logical id, stable across runs.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Declared attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

/// Outcome of resolving every attribute of a node.
pub type ResolvedAttributes = BTreeMap<String, Value>;

impl ResourceNode {
    /// Creates a node with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns the declared value of an attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    /// Returns every reference held by this node.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes.values().flat_map(AttrValue::references).collect()
    }

    /// Returns the ids this node depends on.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.references().into_iter().map(|r| r.target.as_str()).collect()
    }

    /// Resolves all attributes.
    ///
    /// # Errors
    ///
    /// Returns the names of attributes holding a reference that `lookup`
    /// cannot resolve.
    pub fn resolve_attributes<F>(&self, lookup: &F) -> Result<ResolvedAttributes, Vec<String>>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        let mut resolved = BTreeMap::new();
        let mut unresolved = Vec::new();

        for (name, value) in &self.attributes {
            match value.resolve(lookup) {
                Some(v) => {
                    resolved.insert(name.clone(), v);
                }
                None => unresolved.push(name.clone()),
            }
        }

        if unresolved.is_empty() {
            Ok(resolved)
        } else {
            Err(unresolved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse() {
        let r = Reference::parse("postgres-db.endpoint").unwrap();
        assert_eq!(r.target, "postgres-db");
        assert_eq!(r.output, "endpoint");
        assert!(Reference::parse("postgres-db").is_err());
        assert!(Reference::parse(".endpoint").is_err());
    }

    #[test]
    fn test_yaml_attribute_forms() {
        let yaml = r#"
id: auth-task
kind: container_task_definition
attributes:
  image: registry/auth:1.4
  cpu: 256
  environment:
    DB_HOST: { ref: postgres-db.endpoint }
    MODE: prod
  subnets:
    - { ref: app-vpc.private_subnet_a }
    - { ref: app-vpc.private_subnet_b }
"#;
        let node: ResourceNode = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.kind, ResourceKind::ContainerTaskDefinition);
        assert_eq!(node.attribute("image").and_then(AttrValue::as_str), Some("registry/auth:1.4"));
        assert_eq!(node.references().len(), 3);

        let deps: Vec<&str> = node.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["app-vpc", "postgres-db"]);
    }

    #[test]
    fn test_resolve_nested() {
        let node = ResourceNode::new("svc", ResourceKind::ContainerTaskDefinition).with_attribute(
            "environment",
            AttrValue::Map(BTreeMap::from([(
                String::from("DB_HOST"),
                AttrValue::reference("db", "endpoint"),
            )])),
        );

        let known = |r: &Reference| {
            (r.target == "db" && r.output == "endpoint").then(|| Value::from("db.internal"))
        };
        let resolved = node.resolve_attributes(&known).unwrap();
        assert_eq!(resolved["environment"]["DB_HOST"], Value::from("db.internal"));

        let unknown = |_: &Reference| None;
        assert_eq!(
            node.resolve_attributes(&unknown).unwrap_err(),
            vec![String::from("environment")]
        );
    }

    #[test]
    fn test_reference_serializes_back() {
        let value = AttrValue::reference("db", "endpoint");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"ref":"db.endpoint"}"#);
    }
}
