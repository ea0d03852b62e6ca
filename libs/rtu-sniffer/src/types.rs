//! Value and event types flowing out of the sniffer core

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::register::RegisterKind;

/// Identity of a decoded register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RegisterId {
    /// Absolute register address, known from the request or a write frame
    Address(u16),
    /// Position inside a read response whose request was never seen
    Offset(u16),
}

impl RegisterId {
    pub fn address(&self) -> Option<u16> {
        match self {
            RegisterId::Address(address) => Some(*address),
            RegisterId::Offset(_) => None,
        }
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterId::Address(address) => write!(f, "{address}"),
            RegisterId::Offset(offset) => write!(f, "+{offset}"),
        }
    }
}

/// One enumerated bit of a status/alarm register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagState {
    pub bit: u8,
    pub name: String,
    pub set: bool,
}

/// Register value after scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PhysicalValue {
    Number(f64),
    Integer(i64),
    Flags(Vec<FlagState>),
}

impl PhysicalValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PhysicalValue::Number(value) => Some(*value),
            PhysicalValue::Integer(value) => Some(*value as f64),
            PhysicalValue::Flags(_) => None,
        }
    }

    pub fn flags(&self) -> &[FlagState] {
        match self {
            PhysicalValue::Flags(flags) => flags,
            _ => &[],
        }
    }
}

impl fmt::Display for PhysicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Three decimals cover every scale factor in use
            PhysicalValue::Number(value) => write!(f, "{}", (value * 1000.0).round() / 1000.0),
            PhysicalValue::Integer(value) => write!(f, "{value}"),
            PhysicalValue::Flags(flags) => {
                let active: Vec<&str> = flags
                    .iter()
                    .filter(|flag| flag.set)
                    .map(|flag| flag.name.as_str())
                    .collect();
                if active.is_empty() {
                    write!(f, "none")
                } else {
                    write!(f, "{}", active.join(", "))
                }
            },
        }
    }
}

/// A decoded, scaled reading
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterValue {
    pub register_id: RegisterId,
    pub kind: RegisterKind,
    /// Raw register content after sign interpretation
    pub raw_value: i64,
    pub physical_value: PhysicalValue,
    pub unit: Option<String>,
    pub timestamp: Instant,
}

/// Why the state cache emitted a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// First value seen for this (device, register)
    Initial,
    Changed,
    /// Value unchanged but the staleness interval elapsed
    Refresh,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub device_address: u8,
    pub register_id: RegisterId,
    pub old_value: Option<RegisterValue>,
    pub new_value: RegisterValue,
    pub reason: ChangeReason,
    pub timestamp: Instant,
}

/// Device state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// `first_seen` is true the first time the address appears on the bus
    Online { address: u8, first_seen: bool },
    Offline { address: u8 },
}

impl LifecycleEvent {
    pub fn address(&self) -> u8 {
        match self {
            LifecycleEvent::Online { address, .. } | LifecycleEvent::Offline { address } => *address,
        }
    }
}

/// Everything the core pushes to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Change(ChangeEvent),
    Lifecycle(LifecycleEvent),
}
