//! Load balancer implementation with swappable selection policies

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::backend::instance::Instance;
use crate::backend::registry::InstanceRegistry;
use crate::error::{AppError, Result};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin distribution
    #[default]
    RoundRobin,
    /// Sticky selection keyed by session header or client address
    RequestHash,
}

/// Caller-stable facts about a request used for selection
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_addr: Option<SocketAddr>,
    pub session_key: Option<String>,
}

impl RequestContext {
    pub fn new(client_addr: Option<SocketAddr>, session_key: Option<String>) -> Self {
        Self {
            client_addr,
            session_key,
        }
    }

    /// Key that stays the same across requests from one caller.
    ///
    /// The session key wins over the client IP. The client port is left out
    /// since it changes with every connection.
    pub fn stable_key(&self) -> Option<String> {
        self.session_key
            .clone()
            .or_else(|| self.client_addr.map(|addr| addr.ip().to_string()))
    }
}

/// Chooses exactly one instance for a request
pub trait SelectionPolicy: Send + Sync {
    fn select(&self, registry: &InstanceRegistry, ctx: &RequestContext) -> Result<Arc<Instance>>;

    fn name(&self) -> &'static str;
}

/// Visits every instance once before repeating any
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, registry: &InstanceRegistry, _ctx: &RequestContext) -> Result<Arc<Instance>> {
        let count = registry.count();
        if count == 0 {
            return Err(AppError::NoInstancesAvailable);
        }

        // Each caller gets a distinct cursor value from a single atomic step
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        registry.get(index).ok_or(AppError::NoInstancesAvailable)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Maps a caller-stable key onto an instance index
#[derive(Debug, Default)]
pub struct RequestHash {
    fallback: RoundRobin,
}

impl RequestHash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RequestHash {
    fn select(&self, registry: &InstanceRegistry, ctx: &RequestContext) -> Result<Arc<Instance>> {
        let count = registry.count();
        if count == 0 {
            return Err(AppError::NoInstancesAvailable);
        }

        let Some(key) = ctx.stable_key() else {
            return self.fallback.select(registry, ctx);
        };

        let index = (hash_key(&key) % count as u64) as usize;
        registry.get(index).ok_or(AppError::NoInstancesAvailable)
    }

    fn name(&self) -> &'static str {
        "request_hash"
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn policy_for(strategy: LoadBalancingStrategy) -> Arc<dyn SelectionPolicy> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobin::new()),
        LoadBalancingStrategy::RequestHash => Arc::new(RequestHash::new()),
    }
}

/// Load balancer for distributing requests across instances
pub struct LoadBalancer {
    registry: Arc<InstanceRegistry>,
    active: RwLock<(LoadBalancingStrategy, Arc<dyn SelectionPolicy>)>,
}

impl LoadBalancer {
    /// Create a new load balancer
    pub fn new(registry: Arc<InstanceRegistry>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            registry,
            active: RwLock::new((strategy, policy_for(strategy))),
        }
    }

    /// Set the load balancing strategy. The current policy and its cursor
    /// are kept when the strategy does not change.
    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        let mut active = self.active.write();
        if active.0 != strategy {
            *active = (strategy, policy_for(strategy));
        }
    }

    /// Get the current load balancing strategy
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.active.read().0
    }

    /// Select an instance for a request
    pub fn select_instance(&self, ctx: &RequestContext) -> Result<Arc<Instance>> {
        let policy = self.active.read().1.clone();
        let selected = policy.select(&self.registry, ctx)?;

        debug!(
            instance = %selected,
            policy = policy.name(),
            "Selected instance for request"
        );

        Ok(selected)
    }
}
