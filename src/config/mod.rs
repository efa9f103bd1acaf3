//! Configuration module

pub mod settings;

pub use settings::{
    BalancerConfig, HealthConfig, InstanceConfig, LauncherConfig, LoggingConfig, ProxyConfig,
    ServerConfig, Settings,
};
