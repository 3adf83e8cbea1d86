//! Error types
//!
//! Per-request failures are delivered to the request's own listener,
//! connection-level failures to the connect listeners. Nothing here is
//! fatal to the engine itself.

use thiserror::Error;

/// Errors raised while talking to a serial device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("Permission denied on {path}: {reason}")]
    PermissionDenied { path: String, reason: String },

    #[error("Failed to open {path}: {reason}")]
    PortOpenFailed { path: String, reason: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Response timeout")]
    ResponseTimeout,

    #[error("No response rule: request can never be matched")]
    NoResponseRule,

    #[error("Request queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Reconnect failed after {attempts} attempt(s)")]
    ReconnectFailed { attempts: u32 },

    #[error(transparent)]
    Interceptor(#[from] InterceptorError),

    #[error("Not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SerialError {
    fn from(err: std::io::Error) -> Self {
        SerialError::Io(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SerialError>;

/// Error raised by an interceptor stage; aborts the rest of the pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Interceptor failed: {message}")]
pub struct InterceptorError {
    message: String,
}

impl InterceptorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Configuration validation and loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Setting '{field}' out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("Invalid parity value: {0} (expected 0, 1 or 2)")]
    InvalidParity(u8),

    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            SerialError::QueueFull { capacity: 5 }.to_string(),
            "Request queue full (capacity 5)"
        );
        assert_eq!(
            SerialError::ReconnectFailed { attempts: 3 }.to_string(),
            "Reconnect failed after 3 attempt(s)"
        );
        let err: SerialError = InterceptorError::new("bad checksum").into();
        assert_eq!(err.to_string(), "Interceptor failed: bad checksum");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: SerialError = io.into();
        assert!(matches!(err, SerialError::Io(ref msg) if msg == "gone"));
    }
}
