//! Registry of the backend instances the proxy fronts
//!
//! The registry is populated once at startup and then only read. Writers take
//! the write lock in [`InstanceRegistry::add`]; that is the single mutation
//! entry point, so a future dynamic pool only needs to extend it.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::backend::instance::Instance;
use crate::error::{AppError, Result};

/// Ordered collection of instances, shared by reference across components
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<Vec<Arc<Instance>>>,
}

impl InstanceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Ports are unique within the registry.
    pub fn add(&self, host: impl Into<String>, port: u16) -> Result<Arc<Instance>> {
        let mut instances = self.instances.write();
        if instances.iter().any(|i| i.port() == port) {
            return Err(AppError::DuplicatePort(port));
        }

        let instance = Arc::new(Instance::new(host, port));
        instances.push(instance.clone());

        info!(
            instance = %instance,
            id = %instance.id(),
            total = instances.len(),
            "Registered instance"
        );

        Ok(instance)
    }

    /// Snapshot of all instances in registration order
    pub fn list(&self) -> Vec<Arc<Instance>> {
        self.instances.read().clone()
    }

    /// Instance at `index` in registration order
    pub fn get(&self, index: usize) -> Option<Arc<Instance>> {
        self.instances.read().get(index).cloned()
    }

    pub fn find_by_port(&self, port: u16) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.port() == port)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Ports of all instances in registration order
    pub fn ports(&self) -> Vec<u16> {
        self.instances.read().iter().map(|i| i.port()).collect()
    }
}
