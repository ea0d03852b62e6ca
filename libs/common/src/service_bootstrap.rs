//! Service bootstrap utilities
//!
//! Startup banner and logging initialization shared by the service binaries.

use crate::logging::{self, LogConfig, LoggingConfig};
use tracing::info;

/// Service metadata for startup
pub struct ServiceInfo {
    /// Service name (e.g., "quattsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
    /// Default listen port
    pub default_port: u16,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        default_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            default_port,
        }
    }
}

/// Print startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
  ██████╗ ██╗   ██╗ █████╗ ████████╗████████╗
 ██╔═══██╗██║   ██║██╔══██╗╚══██╔══╝╚══██╔══╝
 ██║   ██║██║   ██║███████║   ██║      ██║
 ██║▄▄ ██║██║   ██║██╔══██║   ██║      ██║
 ╚██████╔╝╚██████╔╝██║  ██║   ██║      ██║
  ╚══▀▀═╝  ╚═════╝ ╚═╝  ╚═╝   ╚═╝      ╚═╝
    "#;

    info!("{}", banner);
    info!("");
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Default Port: {}", service.default_port);
    info!("");
}

/// Initialize logging for a service
///
/// Log directory priority:
/// 1. QUATTSRV_LOG_DIR environment variable
/// 2. `logging.dir` from the configuration
/// 3. Default "logs"
pub fn init_logging(service: &ServiceInfo, logging: &LoggingConfig) -> anyhow::Result<()> {
    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::resolve_log_dir(logging.dir.as_deref()),
        level: logging.level.clone(),
        enable_file: logging.file,
        enable_json: logging.json,
        ..LogConfig::default()
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}
