//! TCP listener for RS485-to-TCP bridges
//!
//! Every accepted connection is an independent tap on the bus with its own
//! [`Pipeline`]. Device state lives in the shared hub and survives
//! reconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use errors::{SnifferError, SnifferResult};
use rtu_sniffer::{Pipeline, PipelineConfig, RegisterTable, SnifferHub, SnifferStats};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 1024;
const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(address: &str) -> SnifferResult<Self> {
        let inner = TcpListener::bind(address)
            .await
            .map_err(|e| SnifferError::BindFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SnifferResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept connections until the token is cancelled
    pub async fn serve(
        self,
        config: PipelineConfig,
        table: Arc<RegisterTable>,
        hub: Arc<SnifferHub>,
        token: CancellationToken,
    ) {
        if let Ok(address) = self.inner.local_addr() {
            info!("Listening for bus data on {}", address);
        }
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Bridge connected from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("TCP_NODELAY not set for {}: {}", peer, e);
                        }
                        let pipeline =
                            Pipeline::new(peer.to_string(), config.clone(), table.clone(), hub.clone());
                        let stats = hub.stats().clone();
                        let token = token.child_token();
                        connections.spawn(async move {
                            handle_connection(stream, pipeline, stats, token).await;
                            info!("Bridge {} disconnected", peer);
                        });
                    },
                    Err(e) => {
                        let err = SnifferError::from(e);
                        err.log("Accept failed");
                        tokio::time::sleep(Duration::from_millis(err.retry_delay_ms())).await;
                    },
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Connection task failed: {}", e);
                    }
                },
            }
        }

        debug!("Listener stopping, {} connections open", connections.len());
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                warn!("Connection task failed: {}", e);
            }
        }
    }
}

/// Drive one byte stream through its pipeline until EOF, error or shutdown
///
/// A partial frame left in the pipeline is discarded with it.
pub async fn handle_connection<R>(
    mut stream: R,
    mut pipeline: Pipeline,
    stats: Arc<SnifferStats>,
    token: CancellationToken,
) -> usize
where
    R: AsyncRead + Unpin,
{
    stats.connection_opened();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frames = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => frames += pipeline.feed(&buf[..n], Instant::now()),
                Err(e) => {
                    warn!("[{}] Read error: {}", pipeline.label(), e);
                    break;
                },
            },
            _ = tick.tick() => frames += pipeline.tick(Instant::now()),
        }
    }

    let sync = pipeline.sync_stats();
    debug!(
        "[{}] Closed after {} frames ({} CRC failures, {} bytes discarded)",
        pipeline.label(),
        frames,
        sync.crc_failures,
        sync.discarded_bytes
    );
    stats.connection_closed();
    frames
}
