//! Static register table
//!
//! Built once at startup, validated, then shared read-only (`Arc`) by every
//! pipeline's decoder and by the publisher.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnifferCoreError};
use crate::types::{FlagState, PhysicalValue};

/// Quatt temperatures are sent as (T + 30 °C) * 100
const TEMPERATURE_OFFSET: i64 = -3000;
const TEMPERATURE_MIN: f64 = -30.0;
const TEMPERATURE_MAX: f64 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Measurement,
    StatusBits,
    AlarmBits,
    Counter,
}

impl RegisterKind {
    pub fn is_bits(&self) -> bool {
        matches!(self, RegisterKind::StatusBits | RegisterKind::AlarmBits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataWidth {
    Bits16,
    /// Two consecutive registers, high word first
    Bits32,
}

impl DataWidth {
    pub fn words(&self) -> usize {
        match self {
            DataWidth::Bits16 => 1,
            DataWidth::Bits32 => 2,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            DataWidth::Bits16 => 16,
            DataWidth::Bits32 => 32,
        }
    }
}

/// Home Assistant device class hint, only used by publishers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Temperature,
    Voltage,
    Current,
    Frequency,
    Speed,
    Pressure,
    Power,
    VolumeFlowRate,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Temperature => "temperature",
            DeviceClass::Voltage => "voltage",
            DeviceClass::Current => "current",
            DeviceClass::Frequency => "frequency",
            DeviceClass::Speed => "speed",
            DeviceClass::Pressure => "pressure",
            DeviceClass::Power => "power",
            DeviceClass::VolumeFlowRate => "volume_flow_rate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitDefinition {
    pub bit: u8,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub id: u16,
    pub name: String,
    pub kind: RegisterKind,
    pub width: DataWidth,
    pub signed: bool,
    pub scale: f64,
    /// Added to the raw value before scaling
    pub offset: i64,
    pub clamp: Option<(f64, f64)>,
    pub unit: Option<String>,
    pub device_class: Option<DeviceClass>,
    /// Enumerated bits of status/alarm registers; unlisted bits are ignored
    pub bits: Vec<BitDefinition>,
}

impl RegisterDefinition {
    fn base(id: u16, name: &str, kind: RegisterKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            width: DataWidth::Bits16,
            signed: false,
            scale: 1.0,
            offset: 0,
            clamp: None,
            unit: None,
            device_class: None,
            bits: Vec::new(),
        }
    }

    pub fn measurement(id: u16, name: &str, scale: f64, unit: &str) -> Self {
        let mut definition = Self::base(id, name, RegisterKind::Measurement);
        definition.scale = scale;
        definition.unit = Some(unit.to_string());
        definition
    }

    pub fn counter(id: u16, name: &str) -> Self {
        Self::base(id, name, RegisterKind::Counter)
    }

    pub fn status_bits(id: u16, name: &str, bits: &[(u8, &str)]) -> Self {
        Self::base(id, name, RegisterKind::StatusBits).with_bits(bits)
    }

    pub fn alarm_bits(id: u16, name: &str, bits: &[(u8, &str)]) -> Self {
        Self::base(id, name, RegisterKind::AlarmBits).with_bits(bits)
    }

    /// Signed temperature in the Quatt (T + 30) * 100 encoding
    pub fn temperature(id: u16, name: &str) -> Self {
        Self::measurement(id, name, 0.01, "°C")
            .signed()
            .with_offset(TEMPERATURE_OFFSET)
            .clamped(TEMPERATURE_MIN, TEMPERATURE_MAX)
            .with_device_class(DeviceClass::Temperature)
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn wide(mut self) -> Self {
        self.width = DataWidth::Bits32;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn clamped(mut self, min: f64, max: f64) -> Self {
        self.clamp = Some((min, max));
        self
    }

    pub fn with_device_class(mut self, class: DeviceClass) -> Self {
        self.device_class = Some(class);
        self
    }

    fn with_bits(mut self, bits: &[(u8, &str)]) -> Self {
        self.bits = bits
            .iter()
            .map(|(bit, name)| BitDefinition {
                bit: *bit,
                name: (*name).to_string(),
            })
            .collect();
        self
    }

    /// Interpret register words (high word first) with the declared
    /// width and signedness.
    pub fn raw_from_words(&self, words: &[u16]) -> Option<i64> {
        match (self.width, words) {
            (DataWidth::Bits16, [word, ..]) => Some(if self.signed {
                i64::from(*word as i16)
            } else {
                i64::from(*word)
            }),
            (DataWidth::Bits32, [high, low, ..]) => {
                let combined = (u32::from(*high) << 16) | u32::from(*low);
                Some(if self.signed {
                    i64::from(combined as i32)
                } else {
                    i64::from(combined)
                })
            },
            _ => None,
        }
    }

    /// Scale a raw value: `(raw + offset) * scale`, clamped if declared
    pub fn physical(&self, raw: i64) -> PhysicalValue {
        match self.kind {
            RegisterKind::StatusBits | RegisterKind::AlarmBits => PhysicalValue::Flags(
                self.bits
                    .iter()
                    .map(|bit| FlagState {
                        bit: bit.bit,
                        name: bit.name.clone(),
                        set: (raw >> bit.bit) & 1 == 1,
                    })
                    .collect(),
            ),
            RegisterKind::Counter if self.scale == 1.0 => PhysicalValue::Integer(raw + self.offset),
            RegisterKind::Counter | RegisterKind::Measurement => {
                let mut value = (raw + self.offset) as f64 * self.scale;
                if let Some((min, max)) = self.clamp {
                    value = value.clamp(min, max);
                }
                PhysicalValue::Number(value)
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SnifferCoreError::table(self.id, "empty name"));
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(SnifferCoreError::table(
                self.id,
                format!("scale must be finite and non-zero, got {}", self.scale),
            ));
        }
        if let Some((min, max)) = self.clamp {
            if min.is_nan() || max.is_nan() || min > max {
                return Err(SnifferCoreError::table(
                    self.id,
                    format!("clamp range {min}..{max} is empty"),
                ));
            }
        }
        if self.kind.is_bits() && self.bits.is_empty() {
            return Err(SnifferCoreError::table(self.id, "bit register without enumerated bits"));
        }
        if !self.kind.is_bits() && !self.bits.is_empty() {
            return Err(SnifferCoreError::table(self.id, "bits declared on a non-bit register"));
        }
        let mut seen = HashSet::new();
        for bit in &self.bits {
            if bit.bit >= self.width.bits() {
                return Err(SnifferCoreError::table(
                    self.id,
                    format!("bit {} outside a {}-bit register", bit.bit, self.width.bits()),
                ));
            }
            if !seen.insert(bit.bit) {
                return Err(SnifferCoreError::table(
                    self.id,
                    format!("bit {} declared twice", bit.bit),
                ));
            }
        }
        Ok(())
    }
}

/// Immutable mapping register id → definition
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterTable {
    registers: BTreeMap<u16, RegisterDefinition>,
}

impl RegisterTable {
    /// Build and validate a table
    pub fn new(definitions: Vec<RegisterDefinition>) -> Result<Self> {
        let mut registers = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            let id = definition.id;
            if registers.insert(id, definition).is_some() {
                return Err(SnifferCoreError::table(id, "duplicate register id"));
            }
        }

        for definition in registers.values() {
            if definition.width == DataWidth::Bits32 {
                let next = definition.id.checked_add(1).ok_or_else(|| {
                    SnifferCoreError::table(definition.id, "32-bit register at the end of the address space")
                })?;
                if registers.contains_key(&next) {
                    return Err(SnifferCoreError::table(
                        definition.id,
                        format!("32-bit register overlaps register {next}"),
                    ));
                }
            }
        }

        Ok(Self { registers })
    }

    /// The Quatt heat pump register map
    pub fn quatt() -> Result<Self> {
        Self::new(quatt_registers())
    }

    pub fn get(&self, id: u16) -> Option<&RegisterDefinition> {
        self.registers.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.values()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

fn quatt_registers() -> Vec<RegisterDefinition> {
    use DeviceClass::*;
    use RegisterDefinition as R;

    vec![
        // Set by the CiC controller through write requests
        R::counter(1999, "Compressor Level set by CiC"),
        R::counter(2010, "Pump Mode set by CiC"),
        R::measurement(2015, "Pump Level set by CiC", 0.01, "%"),
        R::counter(3999, "Working Mode set by CiC"),
        // Read back from the heat pump
        R::counter(2099, "Working Mode Actual"),
        R::measurement(2100, "Compressor AC Voltage", 1.0, "V").with_device_class(Voltage),
        R::measurement(2101, "Compressor AC Current", 0.1, "A").with_device_class(Current),
        R::measurement(2102, "Compressor Frequency Demand", 1.0, "Hz").with_device_class(Frequency),
        R::measurement(2103, "Compressor Frequency Actual", 1.0, "Hz").with_device_class(Frequency),
        R::measurement(2104, "Fan Speed Maximum", 1.0, "RPM").with_device_class(Speed),
        R::measurement(2105, "Fan Speed Actual", 1.0, "RPM").with_device_class(Speed),
        R::measurement(2107, "Electric Expansion Valve", 1.0, "p"),
        R::status_bits(
            2108,
            "Status Bits R2108",
            &[
                (0, "R2108 Fan Low Speed Mode"),
                (2, "R2108 Bottom Heater"),
                (3, "R2108 Crankcase Heater"),
                (4, "R2108 Fan Defrost Speed Mode"),
                (5, "R2108 Fan High Speed Mode"),
                (6, "R2108 4way Valve"),
                (11, "R2108 Pump Relay"),
            ],
        ),
        R::measurement(2109, "EV1 Steps", 1.0, "p"),
        R::temperature(2110, "Outside Temperature"),
        R::temperature(2111, "Evaporator Coil Temperature"),
        R::temperature(2112, "Gas Discharge Temperature"),
        R::temperature(2113, "Gas Return Temperature"),
        R::measurement(2116, "Evaporator Pressure", 0.1, "bar").with_device_class(Pressure),
        R::measurement(2117, "Condenser Pressure", 0.1, "bar").with_device_class(Pressure),
        R::status_bits(2118, "Defrost Mode", &[(0, "Defrost Mode Active")]),
        R::alarm_bits(
            2119,
            "Status Bits R2119",
            &[
                (0, "R2119 Alarm - Main Line Current"),
                (3, "R2119 Info - Compressor Oil Return"),
                (4, "R2119 Alarm - High Pressure Switch"),
                (6, "R2119 Alarm - 1st Start Pre-heat"),
                (9, "R2119 Alarm - AC High/Low Voltage"),
                (12, "R2119 Alarm - Low Pressure Switch"),
            ],
        ),
        R::counter(2120, "Status Bits R2120"),
        R::counter(2121, "Status Bits R2121"),
        R::counter(2122, "Firmware Version"),
        R::counter(2123, "EEPROM Version"),
        R::temperature(2131, "Condensing Temperature"),
        R::temperature(2132, "Evaporating Temperature"),
        R::temperature(2133, "Water In Temperature"),
        R::temperature(2134, "Water Out Temperature"),
        R::temperature(2135, "Condenser Coil Temperature"),
        R::measurement(2137, "Pump Power", 0.1, "W").with_device_class(Power),
        R::measurement(2138, "Pump Flow", 0.618, "L/h").with_device_class(VolumeFlowRate),
    ]
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_quatt_table_is_valid() {
        let table = RegisterTable::quatt().unwrap();
        assert_eq!(table.len(), 33);
        assert_eq!(table.get(2110).unwrap().name, "Outside Temperature");
        assert!(table.get(2106).is_none());
    }

    #[test]
    fn test_temperature_encoding() {
        let table = RegisterTable::quatt().unwrap();
        let outside = table.get(2110).unwrap();

        // 5000 = (20.00 + 30) * 100
        assert_eq!(outside.physical(5000), PhysicalValue::Number(20.0));
        // Clamped to the plausible range
        assert_eq!(outside.physical(30_000), PhysicalValue::Number(150.0));
        let raw = outside.raw_from_words(&[0xFFFF]).unwrap();
        assert_eq!(raw, -1);
        assert_eq!(outside.physical(raw), PhysicalValue::Number(-30.0));
    }

    #[test]
    fn test_signed_register_without_offset() {
        let definition = RegisterDefinition::measurement(10, "Delta", 0.5, "K").signed();
        let raw = definition.raw_from_words(&[0xFFFF]).unwrap();
        assert_eq!(raw, -1);
        assert_eq!(definition.physical(raw), PhysicalValue::Number(-0.5));
    }

    #[test]
    fn test_wide_register_words() {
        let unsigned = RegisterDefinition::counter(100, "Energy").wide();
        assert_eq!(unsigned.raw_from_words(&[0x0001, 0x0002]), Some(65_538));
        assert_eq!(unsigned.raw_from_words(&[0x0001]), None);

        let signed = RegisterDefinition::counter(100, "Energy").wide().signed();
        assert_eq!(signed.raw_from_words(&[0xFFFF, 0xFFFE]), Some(-2));
    }

    #[test]
    fn test_bits_only_enumerated() {
        let table = RegisterTable::quatt().unwrap();
        let status = table.get(2108).unwrap();

        // Bit 1 is set but not enumerated, bit 11 is the pump relay
        let value = status.physical(0b1000_0000_0011);
        let flags = value.flags();
        assert_eq!(flags.len(), 7);
        assert!(flags.iter().all(|flag| flag.bit != 1));
        assert!(flags.iter().find(|flag| flag.bit == 0).unwrap().set);
        assert!(flags.iter().find(|flag| flag.bit == 11).unwrap().set);
        assert!(!flags.iter().find(|flag| flag.bit == 2).unwrap().set);
    }

    #[test]
    fn test_counter_is_integer() {
        let table = RegisterTable::quatt().unwrap();
        assert_eq!(table.get(2122).unwrap().physical(312), PhysicalValue::Integer(312));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let err = RegisterTable::new(vec![
            RegisterDefinition::counter(5, "A"),
            RegisterDefinition::counter(5, "B"),
        ])
        .unwrap_err();
        assert_eq!(err, SnifferCoreError::table(5, "duplicate register id"));
    }

    #[test]
    fn test_rejects_bit_outside_width() {
        let result = RegisterTable::new(vec![RegisterDefinition::status_bits(
            7,
            "Status",
            &[(16, "Too high")],
        )]);
        assert!(matches!(
            result,
            Err(SnifferCoreError::InvalidRegisterTable { register: 7, .. })
        ));
    }

    #[test]
    fn test_rejects_overlapping_wide_register() {
        let result = RegisterTable::new(vec![
            RegisterDefinition::counter(100, "Energy").wide(),
            RegisterDefinition::counter(101, "Other"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_scale() {
        let result = RegisterTable::new(vec![RegisterDefinition::measurement(1, "Flat", 0.0, "")]);
        assert!(result.is_err());
    }
}
