//! Unified error handling for the avg-speed library.
//!
//! Only failures that a caller can act on are surfaced through this type.
//! Mapping inconsistencies and measurement anomalies are logged and dropped
//! where they happen and never become an `AvgSpeedError`.

use thiserror::Error;

/// Unified error type for avg-speed operations.
#[derive(Debug, Clone, Error)]
pub enum AvgSpeedError {
    /// HTTP/API error
    #[error("{}", format_http(message, status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },
    /// Payload could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },
    /// Catalog refresh failed; the previous catalog stays in effect
    #[error("Catalog refresh failed: {message}")]
    Catalog { message: String },
    /// Platform zone monitor refused to watch a checkpoint
    #[error("Zone monitor failed for '{checkpoint_id}': {message}")]
    ZoneMonitor {
        checkpoint_id: String,
        message: String,
    },
    /// Route distance lookup failed
    #[error("Distance lookup failed: {message}")]
    Distance { message: String },
    /// A closed passage could not be turned into a measurement
    #[error("Invalid measurement: {message}")]
    Measurement { message: String },
    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// Upload exceeded its deadline
    #[error("Timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn format_http(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("HTTP error ({}): {}", code, message),
        None => format!("HTTP error: {}", message),
    }
}

impl AvgSpeedError {
    /// Shorthand for an HTTP error without a status code.
    pub fn http(message: impl Into<String>) -> Self {
        AvgSpeedError::Http {
            message: message.into(),
            status_code: None,
        }
    }
}

impl From<std::io::Error> for AvgSpeedError {
    fn from(e: std::io::Error) -> Self {
        AvgSpeedError::Persistence {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AvgSpeedError {
    fn from(e: serde_json::Error) -> Self {
        AvgSpeedError::Decode {
            message: e.to_string(),
        }
    }
}

/// Result type alias for avg-speed operations.
pub type Result<T> = std::result::Result<T, AvgSpeedError>;
