//! Usage tracking between nodes
//!
//! When the simulation moves pods of node A onto node B, A is "using" B and B
//! is "used by" A. Removing a node then only invalidates the cached results of
//! the nodes that depended on the same capacity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Entries kept per direction before a record degrades to "too many"
pub const MAX_USAGE_RECORDED: usize = 50;

/// Usage adjacency of one node
#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    using: HashMap<String, DateTime<Utc>>,
    using_too_many: bool,
    used_by: HashMap<String, DateTime<Utc>>,
    used_by_too_many: bool,
}

impl UsageRecord {
    fn register_using(&mut self, node: &str, at: DateTime<Utc>) {
        if self.using.len() >= MAX_USAGE_RECORDED {
            self.using_too_many = true;
        } else {
            self.using.insert(node.to_string(), at);
        }
    }

    fn register_used_by(&mut self, node: &str, at: DateTime<Utc>) {
        if self.used_by.len() >= MAX_USAGE_RECORDED {
            self.used_by_too_many = true;
        } else {
            self.used_by.insert(node.to_string(), at);
        }
    }

    pub fn using(&self) -> &HashMap<String, DateTime<Utc>> {
        &self.using
    }

    pub fn used_by(&self) -> &HashMap<String, DateTime<Utc>> {
        &self.used_by
    }

    pub fn using_too_many(&self) -> bool {
        self.using_too_many
    }

    pub fn used_by_too_many(&self) -> bool {
        self.used_by_too_many
    }
}

/// Usage records of all nodes
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    usage: HashMap<String, UsageRecord>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` placed pods onto `used`
    pub fn register_usage(&mut self, user: &str, used: &str, at: DateTime<Utc>) {
        self.usage
            .entry(user.to_string())
            .or_default()
            .register_using(used, at);
        self.usage
            .entry(used.to_string())
            .or_default()
            .register_used_by(user, at);
    }

    /// Drop a node and every reference to it
    pub fn unregister(&mut self, node: &str) {
        if let Some(record) = self.usage.remove(node) {
            for using in record.using.keys() {
                if let Some(other) = self.usage.get_mut(using) {
                    other.used_by.remove(node);
                }
            }
            for used_by in record.used_by.keys() {
                if let Some(other) = self.usage.get_mut(used_by) {
                    other.using.remove(node);
                }
            }
        }
    }

    pub fn get(&self, node: &str) -> Option<&UsageRecord> {
        self.usage.get(node)
    }

    /// Forget usages older than `cutoff`; records left empty are removed
    pub fn clean_up(&mut self, cutoff: DateTime<Utc>) {
        let mut to_delete = Vec::new();
        for (key, record) in self.usage.iter_mut() {
            record.using.retain(|_, at| *at >= cutoff);
            record.used_by.retain(|_, at| *at >= cutoff);
            if record.using.is_empty() && record.used_by.is_empty() {
                to_delete.push(key.clone());
            }
        }
        for key in to_delete {
            self.usage.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}

/// Unregister `node` and drop the entries of `cache` that depended on it.
///
/// Every node that shared target capacity with `node` loses its entry. When a
/// record overflowed, the whole cache is cleared.
pub fn remove_node_from_tracker<V>(
    tracker: &mut UsageTracker,
    node: &str,
    cache: &mut HashMap<String, V>,
) {
    let mut clear_all = false;
    let mut keys_to_remove: Vec<String> = Vec::new();

    if let Some(main) = tracker.get(node) {
        if main.using_too_many {
            clear_all = true;
        } else {
            for used in main.using.keys() {
                if let Some(used_record) = tracker.get(used) {
                    if used_record.used_by_too_many {
                        clear_all = true;
                        break;
                    }
                    keys_to_remove.extend(used_record.used_by.keys().cloned());
                }
            }
        }
    }

    tracker.unregister(node);

    if clear_all {
        cache.clear();
    } else {
        for key in keys_to_remove {
            cache.remove(&key);
        }
    }
}
