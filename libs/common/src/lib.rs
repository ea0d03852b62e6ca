//! Shared service plumbing
//!
//! Provides the basic functions every service binary needs:
//! - logging initialization
//! - startup banner
//! - graceful shutdown

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::LoggingConfig;

// Re-export common dependencies
pub use anyhow;
pub use tokio;
pub use tokio_util;
