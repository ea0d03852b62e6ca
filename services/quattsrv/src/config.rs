//! Service configuration
//!
//! Layered with figment, lowest priority first: built-in defaults, the YAML
//! or TOML file, `QUATTSRV_*` environment variables (`__` separates nested
//! keys, e.g. `QUATTSRV_MQTT__BROKER_HOST`), then command line overrides.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use common::LoggingConfig;
use errors::{SnifferError, SnifferResult};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use rtu_sniffer::constants::{MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use rtu_sniffer::{CacheConfig, HubConfig, PipelineConfig, SyncConfig};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

pub const ENV_PREFIX: &str = "QUATTSRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4444,
        }
    }
}

/// Tapped RS485 bus and frame recovery tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub baud_rate: u32,
    /// Fixed inter-frame silence instead of the one derived from baud_rate
    pub silence_override_ms: Option<u64>,
    pub sync_timeout_ms: u64,
    pub max_frame_len: usize,
    pub buffer_capacity: usize,
    pub request_timeout_ms: u64,
    pub crc_log_every: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            baud_rate: sync.baud_rate,
            silence_override_ms: None,
            sync_timeout_ms: sync.sync_timeout.as_millis() as u64,
            max_frame_len: sync.max_frame_len,
            buffer_capacity: sync.buffer_capacity,
            request_timeout_ms: 2000,
            crc_log_every: sync.crc_log_every,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub offline_after_secs: u64,
    pub base_name: String,
    /// Display names keyed by bus address ("1" or "0x01")
    pub names: BTreeMap<String, String>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            offline_after_secs: 60,
            base_name: "Quatt Heat Pump".to_string(),
            names: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub staleness_secs: u64,
    pub min_delta: f64,
    /// Per-register minimum delta keyed by register address
    pub min_delta_overrides: BTreeMap<String, f64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            staleness_secs: 300,
            min_delta: 0.0,
            min_delta_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub device_prefix: String,
    pub discovery_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            username: None,
            password: None,
            client_id: "quattsrv".to_string(),
            device_prefix: "quatt".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuattConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub devices: DevicesConfig,
    pub cache: CacheSettings,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
    pub stats: StatsConfig,
}

impl QuattConfig {
    /// Load from the file named on the command line, environment and CLI
    pub fn load(cli: &Cli) -> SnifferResult<Self> {
        let figment = Self::figment(&cli.config).merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::finish(figment, cli)
    }

    /// Load without consulting the environment
    pub fn load_file(path: &Path, cli: &Cli) -> SnifferResult<Self> {
        Self::finish(Self::figment(path), cli)
    }

    fn figment(path: &Path) -> Figment {
        let figment = Figment::from(Serialized::defaults(QuattConfig::default()));
        if !path.exists() {
            return figment;
        }
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => figment.merge(Toml::file(path)),
            _ => figment.merge(Yaml::file(path)),
        }
    }

    fn finish(figment: Figment, cli: &Cli) -> SnifferResult<Self> {
        let mut config: QuattConfig = figment.extract()?;
        config.apply_cli(cli);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(broker) = &cli.mqtt_broker {
            self.mqtt.broker_host = broker.clone();
        }
        if let Some(username) = &cli.mqtt_username {
            self.mqtt.username = Some(username.clone());
        }
        if let Some(password) = &cli.mqtt_password {
            self.mqtt.password = Some(password.clone());
        }
        if cli.no_mqtt {
            self.mqtt.enabled = false;
        }
        if cli.debug {
            self.logging.level = "debug".to_string();
        }
    }

    /// Empty credentials mean none; passwords lose surrounding quotes
    fn normalize(&mut self) {
        self.mqtt.username = self.mqtt.username.take().filter(|u| !u.is_empty());
        self.mqtt.password = self
            .mqtt
            .password
            .take()
            .map(|p| p.trim_matches(|c| c == '\'' || c == '"').to_string())
            .filter(|p| !p.is_empty());
    }

    pub fn validate(&self) -> SnifferResult<()> {
        if self.server.port == 0 {
            return Err(SnifferError::invalid_config("server.port", "must be greater than zero"));
        }
        if self.bus.baud_rate == 0 {
            return Err(SnifferError::invalid_config("bus.baud_rate", "must be greater than zero"));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.bus.max_frame_len) {
            return Err(SnifferError::invalid_config(
                "bus.max_frame_len",
                format!("must be within {}..={}", MIN_FRAME_SIZE, MAX_FRAME_SIZE),
            ));
        }
        if self.bus.buffer_capacity < self.bus.max_frame_len {
            return Err(SnifferError::invalid_config(
                "bus.buffer_capacity",
                "must hold at least one maximum-length frame",
            ));
        }
        if self.devices.offline_after_secs == 0 {
            return Err(SnifferError::invalid_config(
                "devices.offline_after_secs",
                "must be greater than zero",
            ));
        }
        if self.cache.staleness_secs == 0 {
            return Err(SnifferError::invalid_config(
                "cache.staleness_secs",
                "must be greater than zero",
            ));
        }
        if self.stats.report_interval_secs == 0 {
            return Err(SnifferError::invalid_config(
                "stats.report_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.mqtt.enabled && self.mqtt.broker_host.is_empty() {
            return Err(SnifferError::invalid_config("mqtt.broker_host", "cannot be empty"));
        }
        for key in self.devices.names.keys() {
            parse_address(key)
                .ok_or_else(|| SnifferError::invalid_config("devices.names", format!("'{}' is not a bus address", key)))?;
        }

        self.pipeline_config().validate()?;
        self.hub_config()?.validate()?;
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sync: SyncConfig {
                baud_rate: self.bus.baud_rate,
                silence_override: self.bus.silence_override_ms.map(Duration::from_millis),
                sync_timeout: Duration::from_millis(self.bus.sync_timeout_ms),
                max_frame_len: self.bus.max_frame_len,
                buffer_capacity: self.bus.buffer_capacity,
                crc_log_every: self.bus.crc_log_every,
            },
            request_timeout: Duration::from_millis(self.bus.request_timeout_ms),
        }
    }

    pub fn hub_config(&self) -> SnifferResult<HubConfig> {
        let mut overrides = HashMap::new();
        for (key, delta) in &self.cache.min_delta_overrides {
            let register = parse_register(key).ok_or_else(|| {
                SnifferError::invalid_config(
                    "cache.min_delta_overrides",
                    format!("'{}' is not a register address", key),
                )
            })?;
            overrides.insert(register, *delta);
        }

        Ok(HubConfig {
            offline_after: Duration::from_secs(self.devices.offline_after_secs),
            cache: CacheConfig {
                min_delta: self.cache.min_delta,
                min_delta_overrides: overrides,
                staleness: Duration::from_secs(self.cache.staleness_secs),
            },
        })
    }

    /// Configured device names by bus address
    pub fn device_names(&self) -> BTreeMap<u8, String> {
        self.devices
            .names
            .iter()
            .filter_map(|(key, name)| parse_address(key).map(|address| (address, name.clone())))
            .collect()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Decimal or `0x`-prefixed hexadecimal bus address
fn parse_address(key: &str) -> Option<u8> {
    parse_register(key).and_then(|value| u8::try_from(value).ok())
}

/// Decimal or `0x`-prefixed hexadecimal register address
fn parse_register(key: &str) -> Option<u16> {
    let key = key.trim();
    match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => key.parse().ok(),
    }
}
