//! HTTP front door - health endpoint and catch-all proxy route

pub mod handlers;
pub mod routes;
