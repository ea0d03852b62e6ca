//! Periodic statistics report

use rtu_sniffer::{DeviceRecord, StatsSnapshot};
use tracing::info;

/// One line per device for the periodic report
pub fn device_line(device: &DeviceRecord) -> String {
    let response_time = device
        .last_response_time
        .map(|rt| format!("{:.1}ms", rt.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "Device {:02X}: {} | frames={} requests={} responses={} exceptions={} quality={:.1}% rt={} registers={}",
        device.address,
        if device.is_online() { "online" } else { "offline" },
        device.frames,
        device.requests,
        device.responses,
        device.exceptions,
        device.communication_quality(),
        response_time,
        device.register_values.len()
    )
}

pub fn summary_line(snapshot: &StatsSnapshot) -> String {
    format!(
        "Bus: bytes={} frames={}/{} crc_failures={} resyncs={} discarded={} overflow={} unknown_registers={} changes={} quality={:.1}% connections={}/{} devices={} online, {} offline",
        snapshot.bytes_received,
        snapshot.frames_validated,
        snapshot.frames_attempted,
        snapshot.crc_failures,
        snapshot.resync_events,
        snapshot.discarded_bytes,
        snapshot.overflow_bytes,
        snapshot.unknown_registers,
        snapshot.change_events,
        snapshot.communication_quality,
        snapshot.connections_active,
        snapshot.connections_total,
        snapshot.devices_online,
        snapshot.devices_offline
    )
}

pub fn log_report(snapshot: &StatsSnapshot, devices: &[DeviceRecord]) {
    info!("{}", summary_line(snapshot));
    for device in devices {
        info!("{}", device_line(device));
    }
}
