//! Gateway module - Instance selection, health aggregation, and proxying

pub mod health_check;
pub mod load_balancer;
pub mod proxy;
