//! Shared device state
//!
//! The device registry and the state cache are the only mutable state shared
//! between pipelines. Both live behind one mutex. Events are handed to the
//! non-blocking sink before the lock is released, so their order always
//! matches the order of the state changes that produced them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CacheConfig, SensorStateCache};
use crate::constants::BROADCAST_ADDRESS;
use crate::device::{DeviceRecord, DeviceRegistry};
use crate::error::{Result, SnifferCoreError};
use crate::frame::FrameKind;
use crate::sink::EventSink;
use crate::stats::SnifferStats;
use crate::types::{CoreEvent, LifecycleEvent, RegisterValue};

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Silence after which a device is reported offline
    pub offline_after: Duration,
    pub cache: CacheConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            offline_after: Duration::from_secs(60),
            cache: CacheConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        if self.offline_after.is_zero() {
            return Err(SnifferCoreError::config(
                "offline_after",
                "must be greater than zero",
            ));
        }
        self.cache.validate()
    }
}

/// What a frame says about its device besides register values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameActivity {
    pub kind: FrameKind,
    /// Request-to-response latency when the frame answered a seen request
    pub response_time: Option<Duration>,
}

struct HubState {
    registry: DeviceRegistry,
    cache: SensorStateCache,
}

pub struct SnifferHub {
    state: Mutex<HubState>,
    sink: Box<dyn EventSink>,
    stats: Arc<SnifferStats>,
}

impl SnifferHub {
    pub fn new(config: HubConfig, sink: impl EventSink + 'static, stats: Arc<SnifferStats>) -> Self {
        Self {
            state: Mutex::new(HubState {
                registry: DeviceRegistry::new(config.offline_after),
                cache: SensorStateCache::new(config.cache),
            }),
            sink: Box::new(sink),
            stats,
        }
    }

    /// Route one frame's values to its device and emit resulting events
    ///
    /// Frames that could not be classified (unknown function code or an
    /// impossible length) never create or touch a device.
    pub fn ingest(&self, address: u8, activity: FrameActivity, values: Vec<RegisterValue>, now: Instant) {
        if address == BROADCAST_ADDRESS {
            debug!("Broadcast frame ({} values) not attributed to a device", values.len());
            return;
        }
        if let FrameKind::Other { function } = activity.kind {
            debug!(
                "Unclassified FC{:02X} frame from {:02X} not attributed to a device",
                function, address
            );
            return;
        }

        let mut state = self.state.lock();
        let mut lifecycle = Vec::new();
        state
            .registry
            .route(address, values.iter().cloned(), now, &mut lifecycle);
        state
            .registry
            .record_activity(address, &activity.kind, activity.response_time);

        let mut changes = Vec::new();
        for value in values {
            if let Some(change) = state.cache.observe(address, value, now) {
                changes.push(change);
            }
        }
        self.update_device_counts(&state.registry);
        self.stats.record_change_events(changes.len() as u64);

        self.dispatch(lifecycle);
        for change in changes {
            self.sink.emit(CoreEvent::Change(change));
        }
    }

    /// Offline check for when no frames arrive to trigger one
    pub fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        let lifecycle = state.registry.sweep(now);
        if !lifecycle.is_empty() {
            self.update_device_counts(&state.registry);
        }
        self.dispatch(lifecycle);
    }

    /// Copy of every device record
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.state.lock().registry.iter().cloned().collect()
    }

    pub fn device(&self, address: u8) -> Option<DeviceRecord> {
        self.state.lock().registry.get(address).cloned()
    }

    pub fn stats(&self) -> &Arc<SnifferStats> {
        &self.stats
    }

    fn update_device_counts(&self, registry: &DeviceRegistry) {
        let online = registry.online_count();
        self.stats.set_devices(online, registry.len() - online);
    }

    fn dispatch(&self, lifecycle: Vec<LifecycleEvent>) {
        for event in lifecycle {
            self.sink.emit(CoreEvent::Lifecycle(event));
        }
    }
}

impl std::fmt::Debug for SnifferHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnifferHub")
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::register::RegisterKind;
    use crate::types::{ChangeReason, PhysicalValue, RegisterId};

    fn hub() -> (SnifferHub, Arc<Mutex<Vec<CoreEvent>>>) {
        let events: Arc<Mutex<Vec<CoreEvent>>> = Arc::default();
        let hub = SnifferHub::new(HubConfig::default(), events.clone(), Arc::new(SnifferStats::new()));
        (hub, events)
    }

    fn response() -> FrameActivity {
        FrameActivity {
            kind: FrameKind::ReadResponse {
                function: 3,
                byte_count: 2,
            },
            response_time: None,
        }
    }

    fn value(raw: i64, at: Instant) -> RegisterValue {
        RegisterValue {
            register_id: RegisterId::Address(2122),
            kind: RegisterKind::Counter,
            raw_value: raw,
            physical_value: PhysicalValue::Integer(raw),
            unit: None,
            timestamp: at,
        }
    }

    #[test]
    fn test_ingest_emits_lifecycle_then_change() {
        let (hub, events) = hub();
        let now = Instant::now();

        hub.ingest(1, response(), vec![value(312, now)], now);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            CoreEvent::Lifecycle(LifecycleEvent::Online {
                address: 1,
                first_seen: true
            })
        );
        match &events[1] {
            CoreEvent::Change(change) => {
                assert_eq!(change.device_address, 1);
                assert_eq!(change.reason, ChangeReason::Initial);
            },
            other => panic!("expected a change event, got {other:?}"),
        }
    }

    #[test]
    fn test_repeat_value_is_quiet() {
        let (hub, events) = hub();
        let now = Instant::now();

        hub.ingest(1, response(), vec![value(312, now)], now);
        hub.ingest(1, response(), vec![value(312, now)], now + Duration::from_secs(1));

        assert_eq!(events.lock().len(), 2);
        assert_eq!(hub.device(1).unwrap().frames, 2);
        assert_eq!(hub.stats().snapshot().change_events, 1);
    }

    #[test]
    fn test_sweep_reports_offline() {
        let (hub, events) = hub();
        let t0 = Instant::now();
        hub.ingest(9, response(), Vec::new(), t0);
        events.lock().clear();

        hub.sweep(t0 + Duration::from_secs(30));
        assert!(events.lock().is_empty());

        hub.sweep(t0 + Duration::from_secs(61));
        hub.sweep(t0 + Duration::from_secs(62));
        assert_eq!(
            *events.lock(),
            vec![CoreEvent::Lifecycle(LifecycleEvent::Offline { address: 9 })]
        );
        let snapshot = hub.stats().snapshot();
        assert_eq!(snapshot.devices_online, 0);
        assert_eq!(snapshot.devices_offline, 1);
    }

    #[test]
    fn test_broadcast_is_not_a_device() {
        let (hub, events) = hub();
        let now = Instant::now();
        hub.ingest(0, response(), vec![value(1, now)], now);

        assert!(events.lock().is_empty());
        assert!(hub.devices().is_empty());
    }

    #[test]
    fn test_unclassified_frame_is_not_a_device() {
        let (hub, events) = hub();
        let now = Instant::now();
        let vendor = FrameActivity {
            kind: FrameKind::Other { function: 0x41 },
            response_time: None,
        };
        hub.ingest(7, vendor, Vec::new(), now);

        assert!(events.lock().is_empty());
        assert!(hub.devices().is_empty());
        assert_eq!(hub.stats().snapshot().devices_online, 0);
    }

    #[test]
    fn test_lifecycle_events_follow_state_order() {
        let events: Arc<Mutex<Vec<CoreEvent>>> = Arc::default();
        let config = HubConfig {
            offline_after: Duration::from_nanos(1),
            ..HubConfig::default()
        };
        let hub = SnifferHub::new(config, events.clone(), Arc::new(SnifferStats::new()));

        // One thread keeps the device alive, the other keeps expiring it
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..2000 {
                    hub.ingest(1, response(), Vec::new(), Instant::now());
                }
            });
            scope.spawn(|| {
                for _ in 0..2000 {
                    hub.sweep(Instant::now());
                }
            });
        });

        let lifecycle: Vec<LifecycleEvent> = events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CoreEvent::Lifecycle(event) => Some(*event),
                CoreEvent::Change(_) => None,
            })
            .collect();
        for pair in lifecycle.windows(2) {
            assert_ne!(
                std::mem::discriminant(&pair[0]),
                std::mem::discriminant(&pair[1]),
                "lifecycle events out of order: {pair:?}"
            );
        }

        let last_online = matches!(lifecycle.last(), Some(LifecycleEvent::Online { .. }));
        assert_eq!(last_online, hub.device(1).unwrap().is_online());
    }

    #[test]
    fn test_hub_config_validation() {
        assert!(HubConfig::default().validate().is_ok());
        let zero = HubConfig {
            offline_after: Duration::ZERO,
            ..HubConfig::default()
        };
        assert!(zero.validate().is_err());
    }
}
