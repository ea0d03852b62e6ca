//! Error types for rtu-sniffer
//!
//! Nothing on the byte/frame data path is fatal; these errors only surface
//! while building the static register table or validating tuning parameters.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnifferCoreError {
    #[error("Invalid register table: register {register}: {reason}")]
    InvalidRegisterTable { register: u16, reason: String },

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl SnifferCoreError {
    pub(crate) fn table(register: u16, reason: impl Into<String>) -> Self {
        Self::InvalidRegisterTable {
            register,
            reason: reason.into(),
        }
    }

    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SnifferCoreError>;
