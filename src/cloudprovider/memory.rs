//! In-memory cloud provider
//!
//! Node groups keep their target size and instance list in process. Hooks let
//! the owner materialize or remove cluster nodes when instances come and go.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CloudProvider, CloudProviderError, NodeGroup, ResourceLimiter};
use crate::api::Node;

/// Called with (group id, provider id) for every instance created
pub type ScaleUpHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Called with (group id, node name) for every node deleted
pub type ScaleDownHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_scale_up: RwLock<Option<ScaleUpHook>>,
    on_scale_down: RwLock<Option<ScaleDownHook>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

impl Hooks {
    fn scale_up(&self, group: &str, provider_id: &str) {
        let hook = self
            .on_scale_up
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(group, provider_id);
        }
    }

    fn scale_down(&self, group: &str, node: &str) {
        let hook = self
            .on_scale_down
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(group, node);
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    target: usize,
    instances: Vec<String>,
    next_index: usize,
}

/// A node group whose instances live in memory
#[derive(Debug)]
pub struct InMemoryNodeGroup {
    id: String,
    min_size: usize,
    max_size: usize,
    template: Option<Node>,
    state: Mutex<GroupState>,
    failing: AtomicBool,
    delete_delay_ms: AtomicU64,
    hooks: Arc<Hooks>,
}

impl InMemoryNodeGroup {
    fn state(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_failing(&self) -> Result<(), CloudProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CloudProviderError::Api(format!(
                "node group '{}' is unavailable",
                self.id
            )));
        }
        Ok(())
    }

    /// Provider id for the n-th instance of this group
    pub fn instance_id(&self, index: usize) -> String {
        format!("memory:///{}/{}-{}", self.id, self.id, index)
    }

    /// Add an existing instance without changing the target size
    pub fn add_instance(&self, provider_id: impl Into<String>) {
        let mut state = self.state();
        state.instances.push(provider_id.into());
        state.next_index += 1;
    }

    /// Override the target size
    pub fn set_target(&self, target: usize) {
        self.state().target = target;
    }

    /// Make every provider call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every `delete_nodes` call for this long before it takes effect
    pub fn set_delete_delay(&self, delay: Duration) {
        self.delete_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn has_instance(&self, provider_id: &str) -> bool {
        self.state().instances.iter().any(|i| i == provider_id)
    }

    /// Current target without going through the async trait
    pub fn current_target(&self) -> usize {
        self.state().target
    }
}

#[async_trait]
impl NodeGroup for InMemoryNodeGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn min_size(&self) -> usize {
        self.min_size
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    async fn target_size(&self) -> Result<usize, CloudProviderError> {
        self.check_failing()?;
        Ok(self.state().target)
    }

    async fn increase_size(&self, delta: usize) -> Result<(), CloudProviderError> {
        self.check_failing()?;
        if delta == 0 {
            return Err(CloudProviderError::Api(
                "size increase must be positive".to_string(),
            ));
        }

        let created = {
            let mut state = self.state();
            let desired = state.target + delta;
            if desired > self.max_size {
                return Err(CloudProviderError::MaxSizeExceeded {
                    desired,
                    max: self.max_size,
                });
            }
            state.target = desired;

            let mut created = Vec::with_capacity(delta);
            for _ in 0..delta {
                let provider_id = self.instance_id(state.next_index);
                state.next_index += 1;
                state.instances.push(provider_id.clone());
                created.push(provider_id);
            }
            created
        };

        debug!("Node group {} increased by {}", self.id, delta);
        for provider_id in &created {
            self.hooks.scale_up(&self.id, provider_id);
        }
        Ok(())
    }

    async fn delete_nodes(&self, nodes: &[Node]) -> Result<(), CloudProviderError> {
        let delay = self.delete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_failing()?;
        {
            let mut state = self.state();
            if state.target < nodes.len() + self.min_size {
                return Err(CloudProviderError::MinSizeReached {
                    desired: state.target.saturating_sub(nodes.len()),
                    min: self.min_size,
                });
            }
            if let Some(stray) = nodes
                .iter()
                .find(|n| !state.instances.contains(&n.spec.provider_id))
            {
                return Err(CloudProviderError::Api(format!(
                    "node {} does not belong to node group {}",
                    stray.name(),
                    self.id
                )));
            }
            for node in nodes {
                state.instances.retain(|i| *i != node.spec.provider_id);
                state.target -= 1;
            }
        }

        for node in nodes {
            self.hooks.scale_down(&self.id, node.name());
        }
        Ok(())
    }

    async fn decrease_target_size(&self, delta: usize) -> Result<(), CloudProviderError> {
        self.check_failing()?;
        let mut state = self.state();
        if delta == 0 || delta > state.target {
            return Err(CloudProviderError::Api(format!(
                "invalid target size decrease {} for node group {}",
                delta, self.id
            )));
        }
        if state.target - delta < state.instances.len() {
            return Err(CloudProviderError::Api(format!(
                "attempt to delete existing nodes: target={} delta={} existing={}",
                state.target,
                delta,
                state.instances.len()
            )));
        }
        state.target -= delta;
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<String>, CloudProviderError> {
        self.check_failing()?;
        Ok(self.state().instances.clone())
    }

    fn template_node(&self) -> Result<Node, CloudProviderError> {
        self.template
            .clone()
            .ok_or(CloudProviderError::NotImplemented)
    }
}

/// Cloud provider backed by in-memory node groups
#[derive(Debug, Default)]
pub struct InMemoryCloudProvider {
    groups: DashMap<String, Arc<InMemoryNodeGroup>>,
    limiter: RwLock<Option<ResourceLimiter>>,
    hooks: Arc<Hooks>,
    refreshes: AtomicUsize,
}

impl InMemoryCloudProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node group with an initial target size
    pub fn add_node_group(
        &self,
        id: impl Into<String>,
        min_size: usize,
        max_size: usize,
        target: usize,
        template: Option<Node>,
    ) -> Arc<InMemoryNodeGroup> {
        let id = id.into();
        let group = Arc::new(InMemoryNodeGroup {
            id: id.clone(),
            min_size,
            max_size,
            template,
            state: Mutex::new(GroupState {
                target,
                ..Default::default()
            }),
            failing: AtomicBool::new(false),
            delete_delay_ms: AtomicU64::new(0),
            hooks: Arc::clone(&self.hooks),
        });
        self.groups.insert(id, Arc::clone(&group));
        group
    }

    /// Look up a group by id
    pub fn group(&self, id: &str) -> Option<Arc<InMemoryNodeGroup>> {
        self.groups.get(id).map(|g| Arc::clone(g.value()))
    }

    pub fn set_resource_limiter(&self, limiter: Option<ResourceLimiter>) {
        *self.limiter.write().unwrap_or_else(|e| e.into_inner()) = limiter;
    }

    /// Install the callbacks run when instances are created or deleted
    pub fn set_hooks(&self, on_scale_up: ScaleUpHook, on_scale_down: ScaleDownHook) {
        *self
            .hooks
            .on_scale_up
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(on_scale_up);
        *self
            .hooks
            .on_scale_down
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(on_scale_down);
    }

    /// Number of refresh calls so far
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudProvider for InMemoryCloudProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        let mut groups: Vec<Arc<InMemoryNodeGroup>> =
            self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
            .into_iter()
            .map(|g| g as Arc<dyn NodeGroup>)
            .collect()
    }

    fn node_group_for_node(
        &self,
        node: &Node,
    ) -> Result<Option<Arc<dyn NodeGroup>>, CloudProviderError> {
        if node.spec.provider_id.is_empty() {
            return Ok(None);
        }
        let group = self
            .groups
            .iter()
            .find(|g| g.value().has_instance(&node.spec.provider_id))
            .map(|g| Arc::clone(g.value()) as Arc<dyn NodeGroup>);
        Ok(group)
    }

    fn get_resource_limiter(&self) -> Result<Option<ResourceLimiter>, CloudProviderError> {
        Ok(self
            .limiter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn refresh(&self) -> Result<(), CloudProviderError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
