//! Common error types for the instance proxy

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("No instances available")]
    NoInstancesAvailable,

    #[error("Port {0} is already registered")]
    DuplicatePort(u16),

    #[error("Backend {instance} unreachable: {reason}")]
    BackendUnreachable { instance: String, reason: String },

    #[error("Stream from backend {instance} interrupted: {reason}")]
    BackendStreamInterrupted { instance: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Failed to launch instance: {0}")]
    Launch(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status a client sees for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NoInstancesAvailable
            | AppError::BackendUnreachable { .. }
            | AppError::BackendStreamInterrupted { .. }
            | AppError::HttpClient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::DuplicatePort(_)
            | AppError::Launch(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let reason = status.canonical_reason().unwrap_or("Error");

        (status, format!("{}: {}", reason, self)).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
