//! Application settings and configuration management

use crate::error::{AppError, Result};
use crate::gateway::load_balancer::LoadBalancingStrategy;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Instances that are already running and only need registering
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Outbound proxying configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Applies to the TCP connect phase only; responses have no total timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Upper bound on buffered request bodies, unbounded when unset
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
}

fn default_connect_timeout() -> u64 {
    5000
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            max_body_bytes: None,
        }
    }
}

/// Instance selection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    /// Header whose value keys the request-hash strategy
    #[serde(default = "default_session_header")]
    pub session_header: String,
}

fn default_session_header() -> String {
    "x-session-id".to_string()
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::default(),
            session_header: default_session_header(),
        }
    }
}

/// Health probing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Background probing interval; 0 disables the background task
    #[serde(default)]
    pub interval_secs: u64,
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_path: default_probe_path(),
            probe_timeout_secs: default_probe_timeout(),
            interval_secs: 0,
        }
    }
}

/// Backend process launcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LauncherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_commands_file")]
    pub commands_file: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Host the launched instances listen on
    #[serde(default = "default_instance_host")]
    pub host: String,
}

fn default_true() -> bool {
    true
}

fn default_commands_file() -> String {
    "llamafile_commands.txt".to_string()
}

fn default_output_dir() -> String {
    "llamafile_outputs".to_string()
}

fn default_instance_host() -> String {
    "localhost".to_string()
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            commands_file: default_commands_file(),
            output_dir: default_output_dir(),
            host: default_instance_host(),
        }
    }
}

/// Statically configured instance
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    #[serde(default = "default_instance_host")]
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let proxy_port = match std::env::var("PROXY_PORT") {
            Ok(raw) => Some(raw.trim().parse::<u16>().map_err(|e| {
                AppError::Config(config::ConfigError::Message(format!(
                    "PROXY_PORT '{}' is not a valid port: {}",
                    raw, e
                )))
            })?),
            Err(_) => None,
        };

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            // Load from configuration file
            .add_source(File::with_name(path.as_ref().to_str().unwrap_or("config/default")).required(false))
            // Override with environment variables (prefixed with LLAMA_PROXY__)
            .add_source(
                Environment::with_prefix("LLAMA_PROXY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            // PROXY_IP / PROXY_PORT take precedence over every other source
            .set_override_option("server.host", std::env::var("PROXY_IP").ok())?
            .set_override_option("server.port", proxy_port.map(i64::from))?
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Config(config::ConfigError::Message(
                "Server port cannot be 0".to_string(),
            )));
        }

        if self.health.probe_timeout_secs == 0 {
            return Err(AppError::Config(config::ConfigError::Message(
                "Health probe timeout must be at least one second".to_string(),
            )));
        }

        if !self.health.probe_path.starts_with('/') {
            return Err(AppError::Config(config::ConfigError::Message(format!(
                "Health probe path '{}' must start with '/'",
                self.health.probe_path
            ))));
        }

        for instance in &self.instances {
            if instance.port == 0 {
                return Err(AppError::Config(config::ConfigError::Message(format!(
                    "Instance on host '{}' has port 0",
                    instance.host
                ))));
            }
        }

        Ok(())
    }

    /// Address the front door binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
