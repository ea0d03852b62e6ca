//! Command line interface

use std::path::PathBuf;

use clap::Parser;

/// Passive Modbus RTU sniffer for Quatt heat pumps
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "quattsrv", version, about)]
pub struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, default_value = "config/quattsrv.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// MQTT broker host (overrides config)
    #[arg(long)]
    pub mqtt_broker: Option<String>,

    /// MQTT username (overrides config)
    #[arg(long)]
    pub mqtt_username: Option<String>,

    /// MQTT password (overrides config)
    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// Disable MQTT and log events instead
    #[arg(long)]
    pub no_mqtt: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    pub validate: bool,
}
