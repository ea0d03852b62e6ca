//! Quatt heat pump bus sniffer service
//!
//! Listens for RS485-to-TCP bridges, decodes the tapped Modbus RTU traffic
//! with [`rtu_sniffer`] and publishes sensor states to Home Assistant over
//! MQTT.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod listener;
pub mod publisher;
pub mod reporter;
pub mod service;

pub use config::QuattConfig;
