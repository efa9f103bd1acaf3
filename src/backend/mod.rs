//! Backend module - Instances, their registry, and the process launcher

pub mod instance;
pub mod launcher;
pub mod registry;
