//! Sensor state cache
//!
//! Holds the last emitted value per (device, register) and decides whether a
//! new observation is worth a [`ChangeEvent`]: on the first value, on a real
//! change, or when the staleness interval has passed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{Result, SnifferCoreError};
use crate::types::{ChangeEvent, ChangeReason, PhysicalValue, RegisterId, RegisterValue};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Smallest change of a numeric measurement that counts as a change
    pub min_delta: f64,
    /// Per-register overrides of `min_delta`
    pub min_delta_overrides: HashMap<u16, f64>,
    /// Re-emit an unchanged value after this long
    pub staleness: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_delta: 0.0,
            min_delta_overrides: HashMap::new(),
            staleness: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_delta.is_finite() || self.min_delta < 0.0 {
            return Err(SnifferCoreError::config(
                "min_delta",
                "must be a finite, non-negative number",
            ));
        }
        if let Some((register, delta)) = self
            .min_delta_overrides
            .iter()
            .find(|(_, delta)| !delta.is_finite() || **delta < 0.0)
        {
            return Err(SnifferCoreError::config(
                format!("min_delta_overrides.{register}"),
                format!("must be a finite, non-negative number, got {delta}"),
            ));
        }
        if self.staleness.is_zero() {
            return Err(SnifferCoreError::config("staleness", "must be greater than zero"));
        }
        Ok(())
    }

    fn delta_for(&self, register_id: RegisterId) -> f64 {
        register_id
            .address()
            .and_then(|address| self.min_delta_overrides.get(&address).copied())
            .unwrap_or(self.min_delta)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    emitted: RegisterValue,
    emitted_at: Instant,
}

#[derive(Debug)]
pub struct SensorStateCache {
    config: CacheConfig,
    entries: HashMap<(u8, RegisterId), CacheEntry>,
}

impl SensorStateCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Compare `value` with the last emission for (device, register)
    pub fn observe(&mut self, device_address: u8, value: RegisterValue, now: Instant) -> Option<ChangeEvent> {
        let key = (device_address, value.register_id);

        let reason = match self.entries.get(&key) {
            None => ChangeReason::Initial,
            Some(entry) => {
                let delta = self.config.delta_for(value.register_id);
                if differs(&entry.emitted.physical_value, &value.physical_value, delta) {
                    ChangeReason::Changed
                } else if now.saturating_duration_since(entry.emitted_at) >= self.config.staleness {
                    ChangeReason::Refresh
                } else {
                    return None;
                }
            },
        };

        let old_value = self
            .entries
            .insert(
                key,
                CacheEntry {
                    emitted: value.clone(),
                    emitted_at: now,
                },
            )
            .map(|entry| entry.emitted);

        Some(ChangeEvent {
            device_address,
            register_id: value.register_id,
            old_value,
            new_value: value,
            reason,
            timestamp: now,
        })
    }

    /// Last emitted value for (device, register)
    pub fn get(&self, device_address: u8, register_id: RegisterId) -> Option<&RegisterValue> {
        self.entries
            .get(&(device_address, register_id))
            .map(|entry| &entry.emitted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn differs(old: &PhysicalValue, new: &PhysicalValue, min_delta: f64) -> bool {
    match (old, new) {
        (PhysicalValue::Number(old), PhysicalValue::Number(new)) => {
            if min_delta > 0.0 {
                (new - old).abs() >= min_delta
            } else {
                old != new
            }
        },
        (old, new) => old != new,
    }
}
