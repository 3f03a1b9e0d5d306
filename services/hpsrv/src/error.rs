//! Error handling for the heat pump supervisory service

use comlink::ComLinkError;
use thiserror::Error;

/// Heat pump service error type
#[derive(Error, Debug, Clone)]
pub enum HpSrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Field bus errors (timeouts, exceptions, framing)
    #[error("Bus error: {0}")]
    Bus(#[from] ComLinkError),

    /// Notification delivery errors
    #[error("Notify error: {0}")]
    NotifyError(String),

    /// Data log sink errors
    #[error("Data log error: {0}")]
    DataLogError(String),

    /// Broadcast hub errors (distribution loop gone)
    #[error("Hub error: {0}")]
    HubError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Rejected operator input
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for the heat pump service
pub type Result<T> = std::result::Result<T, HpSrvError>;

impl HpSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        HpSrvError::ConfigError(msg.into())
    }

    pub fn notify(msg: impl Into<String>) -> Self {
        HpSrvError::NotifyError(msg.into())
    }

    pub fn datalog(msg: impl Into<String>) -> Self {
        HpSrvError::DataLogError(msg.into())
    }

    pub fn hub(msg: impl Into<String>) -> Self {
        HpSrvError::HubError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        HpSrvError::IoError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        HpSrvError::ValidationError(msg.into())
    }

    /// True when the failure came from the field bus
    pub fn is_bus(&self) -> bool {
        matches!(self, HpSrvError::Bus(_))
    }
}

impl From<std::io::Error> for HpSrvError {
    fn from(err: std::io::Error) -> Self {
        HpSrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for HpSrvError {
    fn from(err: figment::Error) -> Self {
        HpSrvError::ConfigError(err.to_string())
    }
}

impl From<serde_yaml::Error> for HpSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        HpSrvError::ConfigError(err.to_string())
    }
}

impl From<csv::Error> for HpSrvError {
    fn from(err: csv::Error) -> Self {
        HpSrvError::DataLogError(err.to_string())
    }
}

impl From<reqwest::Error> for HpSrvError {
    fn from(err: reqwest::Error) -> Self {
        HpSrvError::NotifyError(err.to_string())
    }
}

impl From<HpSrvError> for common::AppError {
    fn from(err: HpSrvError) -> Self {
        match err {
            HpSrvError::Bus(e) => common::AppError::bad_gateway(e.to_string()),
            HpSrvError::ValidationError(msg) => common::AppError::bad_request(msg),
            HpSrvError::HubError(msg) => common::AppError::service_unavailable(msg),
            other => common::AppError::internal_error(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_bus_errors_convert() {
        let err: HpSrvError = ComLinkError::timeout("no response").into();
        assert!(err.is_bus());
        assert_eq!(err.to_string(), "Bus error: Timeout: no response");
    }

    #[test]
    fn test_api_status_mapping() {
        let app: common::AppError = HpSrvError::Bus(ComLinkError::timeout("x")).into();
        assert_eq!(app.status, StatusCode::BAD_GATEWAY);

        let app: common::AppError = HpSrvError::validation("bad coil").into();
        assert_eq!(app.status, StatusCode::BAD_REQUEST);

        let app: common::AppError = HpSrvError::datalog("disk full").into();
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
