//! quattsrv entry point

use clap::Parser;
use common::service_bootstrap::{self, ServiceInfo};
use common::shutdown;
use errors::{SnifferError, SnifferResult};
use quattsrv::cli::Cli;
use quattsrv::config::QuattConfig;
use quattsrv::service;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> SnifferResult<()> {
    let cli = Cli::parse();
    let config = QuattConfig::load(&cli)?;

    let info = ServiceInfo::new(
        "quattsrv",
        env!("CARGO_PKG_VERSION"),
        "Passive Modbus RTU sniffer for Quatt heat pumps",
        config.server.port,
    );
    service_bootstrap::init_logging(&info, &config.logging)
        .map_err(|e| SnifferError::internal(format!("Logging setup failed: {}", e)))?;
    service_bootstrap::print_startup_banner(&info);

    if !cli.config.exists() {
        warn!(
            "Configuration file {} not found, using defaults",
            cli.config.display()
        );
    }

    if cli.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        "Listening on {}, MQTT {}",
        config.listen_address(),
        if config.mqtt.enabled {
            format!("{}:{}", config.mqtt.broker_host, config.mqtt.broker_port)
        } else {
            "disabled".to_string()
        }
    );

    let token = shutdown::shutdown_token();
    if let Err(e) = service::run(config, token).await {
        e.log("Service failed");
        return Err(e);
    }

    info!("quattsrv stopped");
    Ok(())
}
