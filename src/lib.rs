//! Load-balancing reverse proxy for llamafile inference servers
//!
//! Fronts a fixed pool of backend instances, distributes requests among them,
//! relays buffered and event-stream responses, and reports pool health.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{AppError, Result};

use std::sync::Arc;

use backend::registry::InstanceRegistry;
use gateway::{health_check::HealthCheckManager, load_balancer::LoadBalancer, proxy::ProxyEngine};

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub registry: Arc<InstanceRegistry>,
    pub load_balancer: Arc<LoadBalancer>,
    pub health_manager: Arc<HealthCheckManager>,
    pub proxy: Arc<ProxyEngine>,
}

impl AppState {
    /// Wire every component around an already populated registry
    pub fn new(settings: config::Settings, registry: Arc<InstanceRegistry>) -> Result<Self> {
        let load_balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            settings.balancer.strategy,
        ));
        let health_manager = Arc::new(HealthCheckManager::new(registry.clone(), &settings.health)?);
        let proxy = Arc::new(ProxyEngine::new(&settings.proxy)?);

        Ok(Self {
            settings: Arc::new(settings),
            registry,
            load_balancer,
            health_manager,
            proxy,
        })
    }
}
