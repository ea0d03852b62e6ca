//! Device multiplexer
//!
//! One [`DeviceRecord`] per bus address. Records are created on the first
//! frame bearing an address, marked offline after a silence threshold and
//! brought back online by the next frame. They are never removed, so a
//! device keeps its register map across outages.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::frame::FrameKind;
use crate::types::{LifecycleEvent, RegisterId, RegisterValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub address: u8,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub state: DeviceState,
    pub register_values: BTreeMap<RegisterId, RegisterValue>,
    /// Frames routed to this device
    pub frames: u64,
    pub requests: u64,
    pub responses: u64,
    pub exceptions: u64,
    /// Latency between the last correlated request and its response
    pub last_response_time: Option<Duration>,
}

impl DeviceRecord {
    fn new(address: u8, now: Instant) -> Self {
        Self {
            address,
            first_seen: now,
            last_seen: now,
            state: DeviceState::Online,
            register_values: BTreeMap::new(),
            frames: 0,
            requests: 0,
            responses: 0,
            exceptions: 0,
            last_response_time: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    /// Share of routed frames that were not exception responses, in percent
    pub fn communication_quality(&self) -> f64 {
        if self.frames == 0 {
            return 100.0;
        }
        let good = self.frames.saturating_sub(self.exceptions);
        good as f64 * 100.0 / self.frames as f64
    }
}

/// Explicitly owned device store, keyed by bus address
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<u8, DeviceRecord>,
    offline_after: Duration,
}

impl DeviceRegistry {
    pub fn new(offline_after: Duration) -> Self {
        Self {
            devices: BTreeMap::new(),
            offline_after,
        }
    }

    /// Merge decoded values into the record for `address`, creating it or
    /// bringing it back online as needed.
    ///
    /// Every other device is swept for the offline threshold first. All
    /// resulting transitions are appended to `events`.
    pub fn route(
        &mut self,
        address: u8,
        values: impl IntoIterator<Item = RegisterValue>,
        now: Instant,
        events: &mut Vec<LifecycleEvent>,
    ) -> &DeviceRecord {
        events.extend(self.sweep_except(now, Some(address)));

        let record = match self.devices.entry(address) {
            Entry::Vacant(entry) => {
                info!("Device {:02X} online (first seen)", address);
                events.push(LifecycleEvent::Online {
                    address,
                    first_seen: true,
                });
                entry.insert(DeviceRecord::new(address, now))
            },
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                if record.state == DeviceState::Offline {
                    info!(
                        "Device {:02X} back online, {} cached registers kept",
                        address,
                        record.register_values.len()
                    );
                    record.state = DeviceState::Online;
                    events.push(LifecycleEvent::Online {
                        address,
                        first_seen: false,
                    });
                }
                record
            },
        };

        // Bus timestamps may be reordered across taps; last_seen never moves back
        if now > record.last_seen {
            record.last_seen = now;
        }
        for value in values {
            record.register_values.insert(value.register_id, value);
        }
        record
    }

    /// Count a routed frame against its device
    pub fn record_activity(&mut self, address: u8, kind: &FrameKind, response_time: Option<Duration>) {
        let Some(record) = self.devices.get_mut(&address) else {
            return;
        };
        record.frames += 1;
        match kind {
            FrameKind::Exception { .. } => {
                record.responses += 1;
                record.exceptions += 1;
            },
            kind if kind.is_request() => record.requests += 1,
            kind if kind.is_response() => record.responses += 1,
            _ => {},
        }
        if response_time.is_some() {
            record.last_response_time = response_time;
        }
    }

    /// Mark devices silent for longer than the threshold as offline.
    /// Each device transitions at most once per outage.
    pub fn sweep(&mut self, now: Instant) -> Vec<LifecycleEvent> {
        self.sweep_except(now, None)
    }

    fn sweep_except(&mut self, now: Instant, skip: Option<u8>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        for record in self.devices.values_mut() {
            if Some(record.address) != skip
                && record.state == DeviceState::Online
                && now.saturating_duration_since(record.last_seen) > self.offline_after
            {
                record.state = DeviceState::Offline;
                info!(
                    "Device {:02X} offline after {:?} of silence",
                    record.address,
                    now.saturating_duration_since(record.last_seen)
                );
                events.push(LifecycleEvent::Offline {
                    address: record.address,
                });
            }
        }
        events
    }

    pub fn get(&self, address: u8) -> Option<&DeviceRecord> {
        self.devices.get(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.devices.values().filter(|record| record.is_online()).count()
    }

    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }
}
