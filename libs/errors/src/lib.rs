//! Unified error handling for the Quatt bus sniffer service
//!
//! The byte/frame data path never fails; everything here belongs to startup,
//! configuration, the TCP listener and the MQTT publisher.

use rtu_sniffer::SnifferCoreError;
use thiserror::Error;

// ============================================================================
// SnifferError - Main error type
// ============================================================================

/// Main error type for the sniffer service
#[derive(Debug, Error)]
pub enum SnifferError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Register table error: {0}")]
    RegisterTable(String),

    // ======================================
    // Network & Broker Errors
    // ======================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {address}: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    // ======================================
    // Data Errors
    // ======================================
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // System Errors
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using SnifferError
pub type SnifferResult<T> = Result<T, SnifferError>;

/// Error categories for log levels and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Broker,
    Data,
    Internal,
}

impl SnifferError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn mqtt(msg: impl Into<String>) -> Self {
        Self::Mqtt(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::RegisterTable(_) => {
                ErrorCategory::Configuration
            },
            Self::Io(_) | Self::BindFailed { .. } | Self::Network(_) => ErrorCategory::Network,
            Self::Mqtt(_) => ErrorCategory::Broker,
            Self::Serialization(_) => ErrorCategory::Data,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Configuration problems need an operator; connection problems pass
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Mqtt(_) | Self::Io(_))
    }

    /// Recommended delay before reconnecting, in milliseconds
    pub fn retry_delay_ms(&self) -> u64 {
        match self.category() {
            ErrorCategory::Network => 1000,
            ErrorCategory::Broker => 5000,
            _ => 0,
        }
    }

    pub fn log_level(&self) -> tracing::Level {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Internal => tracing::Level::ERROR,
            ErrorCategory::Network | ErrorCategory::Broker => tracing::Level::WARN,
            ErrorCategory::Data => tracing::Level::INFO,
        }
    }

    /// Log at this error's level
    pub fn log(&self, context: &str) {
        match self.log_level() {
            tracing::Level::ERROR => tracing::error!("{}: {}", context, self),
            tracing::Level::WARN => tracing::warn!("{}: {}", context, self),
            _ => tracing::info!("{}: {}", context, self),
        }
    }
}

// Conversion traits for common error types
impl From<SnifferCoreError> for SnifferError {
    fn from(err: SnifferCoreError) -> Self {
        match err {
            SnifferCoreError::InvalidConfig { field, reason } => {
                Self::InvalidConfig { field, reason }
            },
            other @ SnifferCoreError::InvalidRegisterTable { .. } => {
                Self::RegisterTable(other.to_string())
            },
        }
    }
}

impl From<figment::Error> for SnifferError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for SnifferError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::SnifferError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::SnifferError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! mqtt_error {
    ($msg:expr) => {
        $crate::SnifferError::Mqtt($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::SnifferError::Mqtt(format!($fmt, $($arg)*))
    };
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            SnifferError::invalid_config("bus.port", "must be greater than zero").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(SnifferError::mqtt("refused").category(), ErrorCategory::Broker);
        assert_eq!(
            SnifferError::from(std::io::Error::other("reset")).category(),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(SnifferError::network("reset by peer").is_retryable());
        assert!(SnifferError::mqtt("connection refused").is_retryable());
        assert!(!SnifferError::config("missing file").is_retryable());
        assert_eq!(SnifferError::config("missing file").retry_delay_ms(), 0);
        assert_eq!(SnifferError::mqtt("refused").retry_delay_ms(), 5000);
    }

    #[test]
    fn test_core_error_conversion() {
        let core = SnifferCoreError::InvalidConfig {
            field: "sync.max_frame_len".into(),
            reason: "below minimum frame size".into(),
        };
        match SnifferError::from(core) {
            SnifferError::InvalidConfig { field, .. } => assert_eq!(field, "sync.max_frame_len"),
            other => panic!("unexpected conversion: {other:?}"),
        }

        let table = SnifferCoreError::InvalidRegisterTable {
            register: 2108,
            reason: "duplicate".into(),
        };
        assert!(matches!(
            SnifferError::from(table),
            SnifferError::RegisterTable(_)
        ));
    }

    #[test]
    fn test_macros() {
        let err = config_error!("bad port {}", 0);
        assert_eq!(err.to_string(), "Configuration error: bad port 0");
        let err = mqtt_error!("broker gone");
        assert_eq!(err.to_string(), "MQTT error: broker gone");
    }

    #[test]
    fn test_log_level() {
        assert_eq!(SnifferError::internal("x").log_level(), tracing::Level::ERROR);
        assert_eq!(SnifferError::network("x").log_level(), tracing::Level::WARN);
    }
}
