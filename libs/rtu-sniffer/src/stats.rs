//! Observability counters shared by every pipeline and the hub

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::sync::SyncStats;

/// Lock-free counters, updated from any pipeline
#[derive(Debug, Default)]
pub struct SnifferStats {
    bytes_received: AtomicU64,
    frames_attempted: AtomicU64,
    frames_validated: AtomicU64,
    crc_failures: AtomicU64,
    structural_mismatches: AtomicU64,
    resync_events: AtomicU64,
    discarded_bytes: AtomicU64,
    overflow_bytes: AtomicU64,
    unknown_registers: AtomicU64,
    change_events: AtomicU64,
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    devices_online: AtomicU64,
    devices_offline: AtomicU64,
}

impl SnifferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add synchronizer counters accumulated since the last report
    pub fn record_sync(&self, delta: &SyncStats) {
        self.bytes_received.fetch_add(delta.bytes_received, Ordering::Relaxed);
        self.frames_attempted.fetch_add(delta.frames_attempted, Ordering::Relaxed);
        self.frames_validated.fetch_add(delta.frames_validated, Ordering::Relaxed);
        self.crc_failures.fetch_add(delta.crc_failures, Ordering::Relaxed);
        self.structural_mismatches
            .fetch_add(delta.structural_mismatches, Ordering::Relaxed);
        self.resync_events.fetch_add(delta.resync_events, Ordering::Relaxed);
        self.discarded_bytes.fetch_add(delta.discarded_bytes, Ordering::Relaxed);
        self.overflow_bytes.fetch_add(delta.overflow_bytes, Ordering::Relaxed);
    }

    pub fn record_unknown_register(&self) {
        self.unknown_registers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_change_events(&self, count: u64) {
        self.change_events.fetch_add(count, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Never wraps below zero on an unbalanced close
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| active.checked_sub(1));
    }

    pub fn set_devices(&self, online: usize, offline: usize) {
        self.devices_online.store(online as u64, Ordering::Relaxed);
        self.devices_offline.store(offline as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let frames_attempted = self.frames_attempted.load(Ordering::Relaxed);
        let frames_validated = self.frames_validated.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_attempted,
            frames_validated,
            crc_failures: self.crc_failures.load(Ordering::Relaxed),
            structural_mismatches: self.structural_mismatches.load(Ordering::Relaxed),
            resync_events: self.resync_events.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            overflow_bytes: self.overflow_bytes.load(Ordering::Relaxed),
            unknown_registers: self.unknown_registers.load(Ordering::Relaxed),
            change_events: self.change_events.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            devices_online: self.devices_online.load(Ordering::Relaxed),
            devices_offline: self.devices_offline.load(Ordering::Relaxed),
            communication_quality: if frames_attempted == 0 {
                100.0
            } else {
                (frames_validated as f64 / frames_attempted as f64 * 100.0).min(100.0)
            },
        }
    }
}

/// Point-in-time copy of [`SnifferStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub frames_attempted: u64,
    pub frames_validated: u64,
    pub crc_failures: u64,
    pub structural_mismatches: u64,
    pub resync_events: u64,
    pub discarded_bytes: u64,
    pub overflow_bytes: u64,
    pub unknown_registers: u64,
    pub change_events: u64,
    pub connections_active: u64,
    pub connections_total: u64,
    pub devices_online: u64,
    pub devices_offline: u64,
    /// Validated frames per CRC evaluation, in percent
    pub communication_quality: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sync_accumulates() {
        let stats = SnifferStats::new();
        let delta = SyncStats {
            bytes_received: 20,
            frames_attempted: 4,
            frames_validated: 2,
            crc_failures: 1,
            ..SyncStats::default()
        };
        stats.record_sync(&delta);
        stats.record_sync(&delta);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_received, 40);
        assert_eq!(snapshot.frames_validated, 4);
        assert_eq!(snapshot.crc_failures, 2);
        assert!((snapshot.communication_quality - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_connection_counters() {
        let stats = SnifferStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_closed();
        stats.connection_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_active, 0);
        assert_eq!(snapshot.connections_total, 2);
    }

    #[test]
    fn test_empty_snapshot_quality() {
        assert_eq!(SnifferStats::new().snapshot().communication_quality, 100.0);
    }
}
