//! Health probing and pool-wide health aggregation

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::instance::Instance;
use crate::backend::registry::InstanceRegistry;
use crate::config::HealthConfig;
use crate::error::{AppError, Result};

/// Why a probe did not report the instance as healthy
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("unparseable body: {0}")]
    Body(String),

    #[error("status marker was {0:?}")]
    NotOk(Option<String>),
}

/// Liveness check against a single instance
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> std::result::Result<(), ProbeError>;
}

#[derive(Debug, Deserialize)]
struct ProbeBody {
    status: Option<String>,
}

/// Probes `GET <probe_path>` and expects `{"status": "ok"}`
pub struct HttpHealthProbe {
    client: Client,
    probe_path: String,
}

impl HttpHealthProbe {
    pub fn new(probe_path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create probe client: {}", e)))?;

        Ok(Self {
            client,
            probe_path: probe_path.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, instance: &Instance) -> std::result::Result<(), ProbeError> {
        let response = self
            .client
            .get(instance.url_for(&self.probe_path))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        let body: ProbeBody =
            serde_json::from_slice(&bytes).map_err(|e| ProbeError::Body(e.to_string()))?;

        match body.status.as_deref() {
            Some("ok") => Ok(()),
            _ => Err(ProbeError::NotOk(body.status)),
        }
    }
}

/// Overall pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Ok,
    Degraded,
}

/// Result of one fan-out over the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: PoolStatus,
    pub healthy_instances: usize,
    pub total_instances: usize,
    pub health_percentage: f64,
}

impl HealthSummary {
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        let health_percentage = if total > 0 {
            healthy as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        // An empty pool reports degraded; startup never serves one
        let status = if total > 0 && healthy == total {
            PoolStatus::Ok
        } else {
            PoolStatus::Degraded
        };

        Self {
            status,
            healthy_instances: healthy,
            total_instances: total,
            health_percentage,
        }
    }
}

/// Health check manager
pub struct HealthCheckManager {
    registry: Arc<InstanceRegistry>,
    probe: Arc<dyn HealthProbe>,
    probe_timeout: Duration,
    check_task: RwLock<Option<JoinHandle<()>>>,
}

impl HealthCheckManager {
    /// Create a manager probing over HTTP as configured
    pub fn new(registry: Arc<InstanceRegistry>, config: &HealthConfig) -> Result<Self> {
        let probe = HttpHealthProbe::new(config.probe_path.clone(), config.probe_timeout())?;
        Ok(Self::with_probe(registry, Arc::new(probe), config.probe_timeout()))
    }

    /// Create a manager with a custom probe
    pub fn with_probe(
        registry: Arc<InstanceRegistry>,
        probe: Arc<dyn HealthProbe>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            probe_timeout,
            check_task: RwLock::new(None),
        }
    }

    /// Probe one instance, reducing every failure to `false`
    pub async fn check_instance(&self, instance: &Instance) -> bool {
        let outcome = match tokio::time::timeout(self.probe_timeout, self.probe.probe(instance)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.probe_timeout)),
        };

        let healthy = match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(instance = %instance, error = %e, "Health check failed");
                false
            }
        };

        instance.record_health(healthy);
        healthy
    }

    /// Probe every instance concurrently and summarize
    pub async fn summary(&self) -> HealthSummary {
        let instances = self.registry.list();
        let results = join_all(instances.iter().map(|i| self.check_instance(i))).await;

        let healthy = results.iter().filter(|&&ok| ok).count();
        let summary = HealthSummary::from_counts(healthy, instances.len());

        debug!(
            healthy = summary.healthy_instances,
            total = summary.total_instances,
            status = ?summary.status,
            "Health check completed"
        );

        summary
    }

    /// Start the periodic background probe
    pub async fn start(self: &Arc<Self>, interval_secs: u64) {
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs);

            loop {
                let summary = manager.summary().await;
                if summary.status == PoolStatus::Degraded {
                    warn!(
                        healthy = summary.healthy_instances,
                        total = summary.total_instances,
                        "Instance pool degraded"
                    );
                }

                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.check_task.write().await.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval_secs, "Started health check background task");
    }

    /// Stop the health check background task
    pub async fn stop(&self) {
        if let Some(handle) = self.check_task.write().await.take() {
            handle.abort();
            info!("Stopped health check background task");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.check_task
            .read()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
