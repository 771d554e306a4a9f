//! Shared resource types for cluster objects
//!
//! Quantities are kept as plain integers: CPU in millicores, memory in bytes,
//! accelerators and pod slots as counts.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// CPU, in millicores
pub const RESOURCE_CPU: &str = "cpu";

/// Memory, in bytes
pub const RESOURCE_MEMORY: &str = "memory";

/// NVIDIA accelerators, as a count
pub const RESOURCE_NVIDIA_GPU: &str = "nvidia.com/gpu";

/// Maximum number of pods a node accepts
pub const RESOURCE_PODS: &str = "pods";

/// A set of named resource quantities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    /// Create an empty resource list
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a quantity (builder style)
    pub fn with(mut self, name: impl Into<String>, value: i64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// CPU in millicores and memory in bytes
    pub fn cpu_memory(cpu_millis: i64, memory: i64) -> Self {
        Self::new()
            .with(RESOURCE_CPU, cpu_millis)
            .with(RESOURCE_MEMORY, memory)
    }

    /// Get a quantity, `None` if the resource is not listed
    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    /// Get a quantity, treating missing resources as zero
    pub fn get_or_zero(&self, name: &str) -> i64 {
        self.get(name).unwrap_or(0)
    }

    /// Set a quantity
    pub fn insert(&mut self, name: impl Into<String>, value: i64) {
        self.0.insert(name.into(), value);
    }

    /// Add every quantity of `other` into this list
    pub fn add(&mut self, other: &ResourceList) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += value;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Metadata shared by every cluster object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name, unique per namespace
    pub name: String,

    /// Namespace; empty for cluster-scoped objects such as nodes
    #[serde(default)]
    pub namespace: String,

    /// Labels for selection
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Annotations for metadata storage
    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Owning objects
    #[serde(rename = "ownerReferences")]
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    /// Creation timestamp
    #[serde(rename = "creationTimestamp")]
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,

    /// Set once the object is being deleted
    #[serde(rename = "deletionTimestamp")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Create metadata for a cluster-scoped object
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            owner_references: Vec::new(),
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    /// Create metadata for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let mut meta = Self::named(name);
        meta.namespace = namespace.into();
        meta
    }

    /// Whether the annotation is present with the given value
    pub fn has_annotation(&self, key: &str, value: &str) -> bool {
        self.annotations.get(key).map(|v| v == value).unwrap_or(false)
    }
}

/// Reference from an object to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Kind of the owner, e.g. "ReplicaSet"
    pub kind: String,

    /// Name of the owner, in the same namespace as the owned object
    pub name: String,

    /// Whether the owner is the managing controller
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Reference to a managing controller
    pub fn controller(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            controller: true,
        }
    }
}

/// Label selector for filtering resources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
        }
    }

    /// Check if labels match this selector. An empty selector matches everything.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_list_add() {
        let mut total = ResourceList::cpu_memory(500, 1024);
        total.add(&ResourceList::cpu_memory(250, 1024).with(RESOURCE_NVIDIA_GPU, 1));

        assert_eq!(total.get(RESOURCE_CPU), Some(750));
        assert_eq!(total.get(RESOURCE_MEMORY), Some(2048));
        assert_eq!(total.get(RESOURCE_NVIDIA_GPU), Some(1));
        assert_eq!(total.get(RESOURCE_PODS), None);
        assert_eq!(total.get_or_zero(RESOURCE_PODS), 0);
    }

    #[test]
    fn test_label_selector_matches() {
        let selector = LabelSelector::matching("app", "web");

        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "frontend".to_string());
        assert!(selector.matches(&labels));

        labels.insert("app".to_string(), "db".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.matches(&HashMap::new()));
    }

    #[test]
    fn test_resource_list_yaml() {
        let list: ResourceList = serde_yaml::from_str("cpu: 2000\nmemory: 4096\n").unwrap();
        assert_eq!(list, ResourceList::cpu_memory(2000, 4096));
    }
}
