//! Deterministic hashing for change detection.
//!
//! Attribute maps are hashed over their canonical JSON form. `BTreeMap`
//! and `serde_json`'s default map keep keys sorted, so equal attribute sets
//! always produce the same hash.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::DriftlessConfig;
use crate::model::{AttrValue, ResolvedAttributes, ResourceNode};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole declaration.
    ///
    /// Only the project identity and the resource list contribute; tuning
    /// knobs such as concurrency do not change what gets deployed.
    #[must_use]
    pub fn hash_config(&self, config: &DriftlessConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.project.environment.as_bytes());

        let mut nodes: Vec<&ResourceNode> = config.resources.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for node in nodes {
            hasher.update([0u8]);
            hasher.update(self.hash_node(node).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a node's declared form, references unresolved.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();
        hasher.update(node.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(node.kind.as_str().as_bytes());
        for (name, value) in &node.attributes {
            hasher.update([0u8]);
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(canonical_declared(value).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a resolved attribute map.
    ///
    /// This is the value recorded in state and compared on the next plan.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &ResolvedAttributes) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in attributes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(canonical(value).as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Serializes a JSON value with object keys sorted.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

fn canonical_declared(value: &AttrValue) -> String {
    match value {
        AttrValue::Reference(r) => format!("ref({r})"),
        AttrValue::Literal(v) => canonical(v),
        AttrValue::List(items) => {
            let body: Vec<String> = items.iter().map(canonical_declared).collect();
            format!("[{}]", body.join(","))
        }
        AttrValue::Map(entries) => {
            let body: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_declared(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> ResolvedAttributes {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_attribute_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let a = attrs(&[("cidr", json!("10.0.0.0/16")), ("max_azs", json!(2))]);
        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&a.clone()));
    }

    #[test]
    fn test_nested_key_order_ignored() {
        let hasher = ConfigHasher::new();
        let a = attrs(&[("env", serde_json::from_str(r#"{"A":"1","B":"2"}"#).unwrap())]);
        let b = attrs(&[("env", serde_json::from_str(r#"{"B":"2","A":"1"}"#).unwrap())]);
        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_different_values_different_hash() {
        let hasher = ConfigHasher::new();
        let a = attrs(&[("desired_count", json!(2))]);
        let b = attrs(&[("desired_count", json!(3))]);
        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_node_hash_sees_references() {
        let hasher = ConfigHasher::new();
        let a = ResourceNode::new("c", ResourceKind::Cluster).with_attribute("network", AttrValue::reference("vpc", "id"));
        let b = ResourceNode::new("c", ResourceKind::Cluster).with_attribute("network", "vpc.id");
        assert_ne!(hasher.hash_node(&a), hasher.hash_node(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
