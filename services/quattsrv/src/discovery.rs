//! Home Assistant MQTT discovery
//!
//! Topic layout, entity configuration payloads and state payloads. Pure
//! functions of the register table and the core's events; the MQTT client
//! lives in [`crate::publisher`].

use std::collections::BTreeMap;

use rtu_sniffer::{
    ChangeEvent, DeviceClass, DeviceRecord, PhysicalValue, RegisterDefinition, RegisterId,
    RegisterTable, RegisterValue,
};
use serde::Serialize;

use crate::config::QuattConfig;

pub const COMMUNICATION_QUALITY: &str = "Communication Quality";
pub const TOTAL_FRAMES: &str = "Total Frames";
pub const RESPONSE_TIME: &str = "Response Time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

/// One MQTT message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: &'static str,
    pub manufacturer: &'static str,
    pub sw_version: &'static str,
    pub via_device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Availability {
    topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct EntityConfig<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: String,
    device: DeviceInfo,
    availability: Vec<Availability>,
    availability_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
}

/// Topic-safe form of an entity name
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace([' ', '-', '/'], "_")
}

pub fn sensor_icon(device_class: Option<DeviceClass>) -> &'static str {
    match device_class {
        Some(DeviceClass::Temperature) => "mdi:thermometer",
        Some(DeviceClass::Power) | Some(DeviceClass::Voltage) => "mdi:lightning-bolt",
        Some(DeviceClass::Pressure) => "mdi:gauge",
        Some(DeviceClass::Current) => "mdi:current-ac",
        Some(DeviceClass::Frequency) => "mdi:sine-wave",
        Some(DeviceClass::Speed) => "mdi:speedometer",
        Some(DeviceClass::VolumeFlowRate) => "mdi:pipe",
        None => "mdi:information",
    }
}

/// Icon for a status bit, picked from its name
pub fn binary_sensor_icon(name: &str) -> Option<&'static str> {
    let name = name.to_lowercase();
    [
        ("alarm", "mdi:alert"),
        ("fan", "mdi:fan"),
        ("heater", "mdi:radiator"),
        ("valve", "mdi:valve"),
        ("pump", "mdi:pump"),
        ("defrost", "mdi:snowflake"),
    ]
    .into_iter()
    .find(|(keyword, _)| name.contains(keyword))
    .map(|(_, icon)| icon)
}

fn binary_payload(set: bool) -> &'static str {
    if set {
        "True"
    } else {
        "False"
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    device_prefix: String,
    discovery_prefix: String,
    base_name: String,
    names: BTreeMap<u8, String>,
}

impl Discovery {
    pub fn new(config: &QuattConfig) -> Self {
        Self {
            device_prefix: config.mqtt.device_prefix.clone(),
            discovery_prefix: config.mqtt.discovery_prefix.clone(),
            base_name: config.devices.base_name.clone(),
            names: config.device_names(),
        }
    }

    pub fn unique_id(&self, address: u8, name: &str) -> String {
        format!("{}_{:02x}_{}", self.device_prefix, address, slugify(name))
    }

    pub fn config_topic(&self, component: Component, address: u8, name: &str) -> String {
        format!(
            "{}/{}/{}/config",
            self.discovery_prefix,
            component.as_str(),
            self.unique_id(address, name)
        )
    }

    pub fn state_topic(&self, component: Component, address: u8, name: &str) -> String {
        format!(
            "{}/{}/{:02x}_{}/state",
            self.device_prefix,
            component.as_str(),
            address,
            slugify(name)
        )
    }

    pub fn bridge_availability_topic(&self) -> String {
        format!("{}/bridge/availability", self.device_prefix)
    }

    pub fn device_availability_topic(&self, address: u8) -> String {
        format!("{}/{:02x}/availability", self.device_prefix, address)
    }

    pub fn device_name(&self, address: u8) -> String {
        self.names
            .get(&address)
            .cloned()
            .unwrap_or_else(|| format!("{} {:02X}", self.base_name, address))
    }

    pub fn device_info(&self, address: u8) -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![format!("{}_heatpump_{:02x}", self.device_prefix, address)],
            name: self.device_name(address),
            model: "Quatt Heat Pump",
            manufacturer: "Quatt",
            sw_version: env!("CARGO_PKG_VERSION"),
            via_device: format!("{}_modbus_bridge", self.device_prefix),
        }
    }

    fn entity<'a>(&self, component: Component, address: u8, name: &'a str) -> EntityConfig<'a> {
        EntityConfig {
            name,
            unique_id: self.unique_id(address, name),
            state_topic: self.state_topic(component, address, name),
            device: self.device_info(address),
            availability: vec![
                Availability {
                    topic: self.bridge_availability_topic(),
                },
                Availability {
                    topic: self.device_availability_topic(address),
                },
            ],
            availability_mode: "all",
            unit_of_measurement: None,
            device_class: None,
            icon: None,
            payload_on: None,
            payload_off: None,
        }
    }

    fn config_message(&self, component: Component, address: u8, entity: &EntityConfig<'_>) -> serde_json::Result<Message> {
        Ok(Message {
            topic: self.config_topic(component, address, entity.name),
            payload: serde_json::to_string(entity)?,
            retain: true,
        })
    }

    /// Discovery configuration for every entity of one heat pump
    pub fn device_configs(&self, address: u8, table: &RegisterTable) -> serde_json::Result<Vec<Message>> {
        let mut messages = Vec::new();

        for definition in table.iter() {
            messages.push(self.sensor_config(address, definition)?);
            for bit in &definition.bits {
                let mut entity = self.entity(Component::BinarySensor, address, &bit.name);
                entity.icon = binary_sensor_icon(&bit.name);
                entity.payload_on = Some("True");
                entity.payload_off = Some("False");
                messages.push(self.config_message(Component::BinarySensor, address, &entity)?);
            }
        }

        for (name, unit, icon) in [
            (COMMUNICATION_QUALITY, Some("%"), "mdi:signal"),
            (TOTAL_FRAMES, None, "mdi:counter"),
            (RESPONSE_TIME, Some("ms"), "mdi:timer"),
        ] {
            let mut entity = self.entity(Component::Sensor, address, name);
            entity.unit_of_measurement = unit;
            entity.icon = Some(icon);
            messages.push(self.config_message(Component::Sensor, address, &entity)?);
        }

        Ok(messages)
    }

    fn sensor_config(&self, address: u8, definition: &RegisterDefinition) -> serde_json::Result<Message> {
        let mut entity = self.entity(Component::Sensor, address, &definition.name);
        entity.unit_of_measurement = definition.unit.as_deref().filter(|unit| !unit.is_empty());
        entity.device_class = definition.device_class.map(|class| class.as_str());
        entity.icon = Some(sensor_icon(definition.device_class));
        self.config_message(Component::Sensor, address, &entity)
    }

    /// State messages for one change; positional values have no entity
    pub fn state_messages(&self, change: &ChangeEvent, table: &RegisterTable) -> Vec<Message> {
        self.value_messages(change.device_address, &change.new_value, table)
    }

    /// Last known state of a device: availability, then every anchored value
    pub fn device_state(&self, device: &DeviceRecord, table: &RegisterTable) -> Vec<Message> {
        let mut messages = vec![self.availability(device.address, device.is_online())];
        for value in device.register_values.values() {
            messages.extend(self.value_messages(device.address, value, table));
        }
        messages
    }

    fn value_messages(&self, address: u8, value: &RegisterValue, table: &RegisterTable) -> Vec<Message> {
        let RegisterId::Address(register) = value.register_id else {
            return Vec::new();
        };
        let Some(definition) = table.get(register) else {
            return Vec::new();
        };

        match &value.physical_value {
            PhysicalValue::Flags(flags) => {
                let mut messages = vec![self.state(
                    Component::Sensor,
                    address,
                    &definition.name,
                    value.raw_value.to_string(),
                )];
                messages.extend(flags.iter().map(|flag| {
                    self.state(
                        Component::BinarySensor,
                        address,
                        &flag.name,
                        binary_payload(flag.set).to_string(),
                    )
                }));
                messages
            },
            physical => vec![self.state(
                Component::Sensor,
                address,
                &definition.name,
                physical.to_string(),
            )],
        }
    }

    /// Per-device communication statistics
    pub fn stats_messages(&self, device: &DeviceRecord) -> Vec<Message> {
        let address = device.address;
        let mut messages = vec![
            self.state(
                Component::Sensor,
                address,
                COMMUNICATION_QUALITY,
                format!("{:.1}", device.communication_quality()),
            ),
            self.state(Component::Sensor, address, TOTAL_FRAMES, device.frames.to_string()),
        ];
        if let Some(response_time) = device.last_response_time {
            messages.push(self.state(
                Component::Sensor,
                address,
                RESPONSE_TIME,
                format!("{:.1}", response_time.as_secs_f64() * 1000.0),
            ));
        }
        messages
    }

    pub fn availability(&self, address: u8, online: bool) -> Message {
        Message {
            topic: self.device_availability_topic(address),
            payload: if online { "online" } else { "offline" }.to_string(),
            retain: true,
        }
    }

    fn state(&self, component: Component, address: u8, name: &str, payload: String) -> Message {
        Message {
            topic: self.state_topic(component, address, name),
            payload,
            retain: false,
        }
    }
}
