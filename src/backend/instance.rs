//! A single backend inference-server process and its last-known health

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Last-known liveness of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Health state together with the time it was observed
#[derive(Debug, Clone, Copy)]
pub struct InstanceHealth {
    pub state: HealthState,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_checked: None,
        }
    }
}

/// One running backend reachable over HTTP at `host:port`
#[derive(Debug)]
pub struct Instance {
    id: Uuid,
    host: String,
    port: u16,
    health: RwLock<InstanceHealth>,
}

impl Instance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            port,
            health: RwLock::new(InstanceHealth::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL without a trailing slash, e.g. `http://localhost:8081`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL for `path_and_query` on this instance
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url(), path_and_query)
        } else {
            format!("{}/{}", self.base_url(), path_and_query)
        }
    }

    pub fn health(&self) -> InstanceHealth {
        *self.health.read()
    }

    /// Record the outcome of a health probe
    pub fn record_health(&self, healthy: bool) {
        let mut health = self.health.write();
        health.state = if healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        health.last_checked = Some(Utc::now());
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
