// File: monitoring/src/errors.rs
//! Error types for the monitoring services

use registry::RegistryError;
use thiserror::Error;

pub type Result<T, E = MonitoringError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MonitoringError {
    /// A required service option is missing or malformed
    #[error("invalid options: {key} {reason}")]
    InvalidOptions { key: String, reason: String },

    #[error("nonexisting endpoint: {endpoint}")]
    NonexistingEndpoint { endpoint: String },

    /// Prometheus answered the reload request with a non-200 status
    #[error("failed to reload config: {status}")]
    ReloadFailed { status: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{service} service is not initialized")]
    NotInitialized { service: &'static str },

    #[error("no Prometheus service configured")]
    PrometheusNotConfigured,
}

impl MonitoringError {
    pub(crate) fn missing_option(key: &str) -> Self {
        MonitoringError::InvalidOptions {
            key: key.to_string(),
            reason: "missing in options".to_string(),
        }
    }

    pub(crate) fn invalid_option(key: &str, reason: &str) -> Self {
        MonitoringError::InvalidOptions {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}
