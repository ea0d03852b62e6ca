//! Event publishers
//!
//! Consume the core's change and lifecycle events. The MQTT publisher feeds
//! Home Assistant; the logging publisher stands in when MQTT is disabled.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{SnifferError, SnifferResult};
use rtu_sniffer::{ChangeEvent, CoreEvent, DeviceRecord, LifecycleEvent, RegisterTable, SnifferHub};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::QuattConfig;
use crate::discovery::{Discovery, Message};
use crate::reporter;

#[async_trait]
pub trait EventPublisher: Send {
    async fn publish_event(&mut self, event: &CoreEvent) -> SnifferResult<()>;

    /// Periodic per-device communication statistics
    async fn publish_stats(&mut self, devices: &[DeviceRecord]) -> SnifferResult<()>;

    /// Called between events, so state can be republished without bus changes
    async fn maintain(&mut self) -> SnifferResult<()> {
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

// ============================================================================
// Logging publisher
// ============================================================================

pub struct LogPublisher {
    table: Arc<RegisterTable>,
}

impl LogPublisher {
    pub fn new(table: Arc<RegisterTable>) -> Self {
        Self { table }
    }

    fn describe(&self, change: &ChangeEvent) -> String {
        let name = change
            .register_id
            .address()
            .and_then(|register| self.table.get(register))
            .map(|definition| definition.name.as_str())
            .unwrap_or("unmapped");
        let unit = change.new_value.unit.as_deref().unwrap_or("");
        format!(
            "Device {:02X} {} [{}] = {}{} ({:?})",
            change.device_address,
            name,
            change.register_id,
            change.new_value.physical_value,
            if unit.is_empty() {
                String::new()
            } else {
                format!(" {}", unit)
            },
            change.reason
        )
    }
}

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish_event(&mut self, event: &CoreEvent) -> SnifferResult<()> {
        match event {
            CoreEvent::Change(change) => info!("{}", self.describe(change)),
            CoreEvent::Lifecycle(LifecycleEvent::Online {
                address,
                first_seen,
            }) => {
                if *first_seen {
                    info!("Heat pump {:02X} discovered", address);
                } else {
                    info!("Heat pump {:02X} back online", address);
                }
            },
            CoreEvent::Lifecycle(LifecycleEvent::Offline { address }) => {
                info!("Heat pump {:02X} offline", address);
            },
        }
        Ok(())
    }

    async fn publish_stats(&mut self, _devices: &[DeviceRecord]) -> SnifferResult<()> {
        Ok(())
    }
}

// ============================================================================
// MQTT publisher
// ============================================================================

/// Connection state shared with the event loop task
#[derive(Debug, Default)]
struct Connection {
    connected: AtomicBool,
    /// Incremented on every accepted connection
    generation: AtomicU64,
}

pub struct MqttPublisher {
    client: AsyncClient,
    discovery: Discovery,
    table: Arc<RegisterTable>,
    hub: Arc<SnifferHub>,
    connection: Arc<Connection>,
    /// Generation whose device state has been republished
    synced_generation: u64,
    /// Devices announced on the current connection generation
    announced: HashSet<u8>,
    announced_generation: u64,
    event_loop: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl MqttPublisher {
    /// Create the client and start its event loop
    ///
    /// Connecting happens in the background. Events are dropped until the
    /// broker accepts the connection; every accepted connection then gets
    /// the hub's current device state.
    pub fn connect(config: &QuattConfig, table: Arc<RegisterTable>, hub: Arc<SnifferHub>) -> Self {
        let discovery = Discovery::new(config);
        let mqtt = &config.mqtt;

        let mut options = MqttOptions::new(&mqtt.client_id, &mqtt.broker_host, mqtt.broker_port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &mqtt.username {
            options.set_credentials(username, mqtt.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            discovery.bridge_availability_topic(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 256);
        let connection = Arc::new(Connection::default());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            discovery.bridge_availability_topic(),
            connection.clone(),
            stop.clone(),
        ));

        info!(
            "MQTT broker {}:{} (client id {})",
            mqtt.broker_host, mqtt.broker_port, mqtt.client_id
        );

        Self {
            client,
            discovery,
            table,
            hub,
            connection,
            synced_generation: 0,
            announced: HashSet::new(),
            announced_generation: 0,
            event_loop: Some(handle),
            stop,
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::Acquire)
    }

    async fn send(&self, message: Message) -> SnifferResult<()> {
        let qos = if message.retain {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        self.client
            .publish(message.topic, qos, message.retain, message.payload)
            .await
            .map_err(|e| SnifferError::mqtt(e.to_string()))
    }

    async fn send_all(&self, messages: Vec<Message>) -> SnifferResult<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Publish discovery once per device and connection
    async fn announce(&mut self, address: u8) -> SnifferResult<()> {
        let generation = self.connection.generation.load(Ordering::Acquire);
        if generation != self.announced_generation {
            self.announced.clear();
            self.announced_generation = generation;
        }
        if self.announced.contains(&address) {
            return Ok(());
        }

        info!(
            "Setting up Home Assistant entities for {}",
            self.discovery.device_name(address)
        );
        let configs = self.discovery.device_configs(address, &self.table)?;
        let count = configs.len();
        self.send_all(configs).await?;
        self.announced.insert(address);
        debug!("Published {} discovery entities for device {:02X}", count, address);
        Ok(())
    }

    /// Republish availability and last values after a (re)connect
    ///
    /// Changes seen while disconnected were dropped and a restarted broker
    /// has lost its retained messages.
    async fn resync(&mut self) -> SnifferResult<()> {
        let generation = self.connection.generation.load(Ordering::Acquire);
        if generation == self.synced_generation {
            return Ok(());
        }

        let devices = self.hub.devices();
        if !devices.is_empty() {
            info!("Republishing state of {} devices", devices.len());
        }
        for device in &devices {
            self.announce(device.address).await?;
            self.send_all(self.discovery.device_state(device, &self.table))
                .await?;
        }
        self.synced_generation = generation;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for MqttPublisher {
    async fn publish_event(&mut self, event: &CoreEvent) -> SnifferResult<()> {
        if !self.is_connected() {
            trace!("MQTT not connected, event dropped");
            return Ok(());
        }
        self.resync().await?;

        match event {
            CoreEvent::Lifecycle(LifecycleEvent::Online { address, .. }) => {
                self.announce(*address).await?;
                self.send(self.discovery.availability(*address, true)).await
            },
            CoreEvent::Lifecycle(LifecycleEvent::Offline { address }) => {
                self.send(self.discovery.availability(*address, false)).await
            },
            CoreEvent::Change(change) => {
                let messages = self.discovery.state_messages(change, &self.table);
                if messages.is_empty() {
                    return Ok(());
                }
                self.announce(change.device_address).await?;
                self.send_all(messages).await
            },
        }
    }

    async fn publish_stats(&mut self, devices: &[DeviceRecord]) -> SnifferResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.resync().await?;
        for device in devices.iter().filter(|device| device.is_online()) {
            self.send_all(self.discovery.stats_messages(device)).await?;
        }
        Ok(())
    }

    async fn maintain(&mut self) -> SnifferResult<()> {
        if self.is_connected() {
            self.resync().await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.is_connected() {
            let offline = Message {
                topic: self.discovery.bridge_availability_topic(),
                payload: "offline".to_string(),
                retain: true,
            };
            if let Err(e) = self.send(offline).await {
                debug!("Bridge availability not published: {}", e);
            }
            if let Err(e) = self.client.disconnect().await {
                debug!("MQTT disconnect failed: {}", e);
            }
        } else {
            // Nothing to flush, stop reconnect attempts now
            self.stop.cancel();
        }

        if let Some(handle) = self.event_loop.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                debug!("MQTT event loop did not stop in time");
            }
        }
        self.stop.cancel();
        info!("MQTT publisher stopped");
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    availability_topic: String,
    connection: Arc<Connection>,
    stop: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = stop.cancelled() => break,
            notification = event_loop.poll() => notification,
        };

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                connection.generation.fetch_add(1, Ordering::AcqRel);
                connection.connected.store(true, Ordering::Release);
                // The event loop must not block on its own request channel
                if let Err(e) = client.try_publish(&availability_topic, QoS::AtLeastOnce, true, "online") {
                    warn!("Bridge availability not published: {}", e);
                }
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connection.connected.store(false, Ordering::Release);
                break;
            },
            Ok(notification) => trace!("MQTT event: {:?}", notification),
            Err(e) => {
                let err = SnifferError::mqtt(e.to_string());
                if connection.connected.swap(false, Ordering::AcqRel) {
                    err.log("Disconnected from MQTT broker");
                } else {
                    debug!("MQTT connection attempt failed: {}", err);
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(err.retry_delay_ms())) => {},
                }
            },
        }
    }
    debug!("MQTT event loop stopped");
}

// ============================================================================
// Event pump
// ============================================================================

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Feed core events and periodic statistics to the publisher until shutdown
pub async fn run(
    mut publisher: Box<dyn EventPublisher>,
    mut events: UnboundedReceiver<CoreEvent>,
    hub: Arc<SnifferHub>,
    report_interval: Duration,
    token: CancellationToken,
) {
    let mut report = tokio::time::interval_at(
        tokio::time::Instant::now() + report_interval,
        report_interval,
    );
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = publisher.publish_event(&event).await {
                    e.log("Event not published");
                }
            },
            _ = maintenance.tick() => {
                if let Err(e) = publisher.maintain().await {
                    e.log("State not republished");
                }
            },
            _ = report.tick() => {
                let devices = hub.devices();
                reporter::log_report(&hub.stats().snapshot(), &devices);
                if let Err(e) = publisher.publish_stats(&devices).await {
                    e.log("Statistics not published");
                }
            },
        }
    }

    // Deliver what the hub emitted before shutdown
    while let Ok(event) = events.try_recv() {
        if let Err(e) = publisher.publish_event(&event).await {
            e.log("Event not published");
        }
    }
    publisher.shutdown().await;
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rtu_sniffer::{
        ChangeReason, HubConfig, PhysicalValue, RegisterId, RegisterKind, RegisterValue,
        SnifferStats,
    };
    use std::time::Instant;

    /// Records what it was asked to publish
    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<CoreEvent>>>,
        stats_calls: Arc<Mutex<usize>>,
        maintain_calls: Arc<Mutex<usize>>,
        shut_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish_event(&mut self, event: &CoreEvent) -> SnifferResult<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        async fn publish_stats(&mut self, _devices: &[DeviceRecord]) -> SnifferResult<()> {
            *self.stats_calls.lock() += 1;
            Ok(())
        }

        async fn maintain(&mut self) -> SnifferResult<()> {
            *self.maintain_calls.lock() += 1;
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn change() -> ChangeEvent {
        let now = Instant::now();
        let value = RegisterValue {
            register_id: RegisterId::Address(2110),
            kind: RegisterKind::Measurement,
            raw_value: 5000,
            physical_value: PhysicalValue::Number(20.0),
            unit: Some("°C".into()),
            timestamp: now,
        };
        ChangeEvent {
            device_address: 1,
            register_id: RegisterId::Address(2110),
            old_value: None,
            new_value: value,
            reason: ChangeReason::Initial,
            timestamp: now,
        }
    }

    #[test]
    fn test_log_publisher_describes_changes() {
        let publisher = LogPublisher::new(Arc::new(RegisterTable::quatt().unwrap()));
        assert_eq!(
            publisher.describe(&change()),
            "Device 01 Outside Temperature [2110] = 20 °C (Initial)"
        );
    }

    #[tokio::test]
    async fn test_run_forwards_events_and_shuts_down() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let hub = Arc::new(SnifferHub::new(
            HubConfig::default(),
            tx.clone(),
            Arc::new(SnifferStats::new()),
        ));
        let recorder = Recorder::default();
        let token = CancellationToken::new();

        let task = tokio::spawn(run(
            Box::new(recorder.clone()),
            rx,
            hub,
            Duration::from_secs(3600),
            token.clone(),
        ));

        tx.send(CoreEvent::Change(change())).unwrap();
        tx.send(CoreEvent::Lifecycle(LifecycleEvent::Offline { address: 1 }))
            .unwrap();
        token.cancel();
        task.await.unwrap();

        assert_eq!(recorder.events.lock().len(), 2);
        assert!(recorder.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_statistics_periodically() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let hub = Arc::new(SnifferHub::new(
            HubConfig::default(),
            tx,
            Arc::new(SnifferStats::new()),
        ));
        let recorder = Recorder::default();
        let token = CancellationToken::new();

        let task = tokio::spawn(run(
            Box::new(recorder.clone()),
            rx,
            hub,
            Duration::from_secs(60),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(125)).await;
        token.cancel();
        task.await.unwrap();

        assert_eq!(*recorder.stats_calls.lock(), 2);
        // Without any bus events the publisher still gets to resync
        assert!(*recorder.maintain_calls.lock() >= 120);
    }

    #[tokio::test]
    async fn test_shutdown_without_broker_does_not_wait() {
        let mut config = QuattConfig::default();
        config.mqtt.broker_host = "127.0.0.1".into();
        config.mqtt.broker_port = 1;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let hub = Arc::new(SnifferHub::new(
            HubConfig::default(),
            tx,
            Arc::new(SnifferStats::new()),
        ));
        let mut publisher =
            MqttPublisher::connect(&config, Arc::new(RegisterTable::quatt().unwrap()), hub);

        assert!(publisher.maintain().await.is_ok());
        tokio::time::timeout(Duration::from_millis(500), publisher.shutdown())
            .await
            .expect("shutdown blocked on an unreachable broker");
    }
}
