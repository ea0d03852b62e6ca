//! Service wiring: hub, listener, publisher and background sweeper

use std::sync::Arc;
use std::time::{Duration, Instant};

use errors::SnifferResult;
use rtu_sniffer::{CoreEvent, RegisterTable, SnifferHub, SnifferStats};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::QuattConfig;
use crate::listener::Listener;
use crate::publisher::{self, EventPublisher, LogPublisher, MqttPublisher};
use crate::reporter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Run until the token is cancelled
pub async fn run(config: QuattConfig, token: CancellationToken) -> SnifferResult<()> {
    let table = Arc::new(RegisterTable::quatt()?);
    info!("Register table loaded: {} registers", table.len());

    let (events_tx, events_rx) = mpsc::unbounded_channel::<CoreEvent>();
    let stats = Arc::new(SnifferStats::new());
    let hub = Arc::new(SnifferHub::new(config.hub_config()?, events_tx, stats));

    let listener = Listener::bind(&config.listen_address()).await?;

    let publisher: Box<dyn EventPublisher> = if config.mqtt.enabled {
        Box::new(MqttPublisher::connect(&config, table.clone(), hub.clone()))
    } else {
        info!("MQTT disabled, events are logged");
        Box::new(LogPublisher::new(table.clone()))
    };
    let publisher_token = CancellationToken::new();
    let publisher_task = tokio::spawn(publisher::run(
        publisher,
        events_rx,
        hub.clone(),
        Duration::from_secs(config.stats.report_interval_secs),
        publisher_token.clone(),
    ));

    let sweeper = tokio::spawn(sweep(hub.clone(), token.clone()));

    listener
        .serve(config.pipeline_config(), table, hub.clone(), token.clone())
        .await;

    if let Err(e) = sweeper.await {
        warn!("Sweeper task failed: {}", e);
    }
    // Events emitted by the final connection teardown still reach the publisher
    publisher_token.cancel();
    if let Err(e) = publisher_task.await {
        warn!("Publisher task failed: {}", e);
    }

    info!("Final statistics:");
    reporter::log_report(&hub.stats().snapshot(), &hub.devices());
    Ok(())
}

/// Offline detection independent of bus traffic
async fn sweep(hub: Arc<SnifferHub>, token: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => hub.sweep(Instant::now()),
        }
    }
}
