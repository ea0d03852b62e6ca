//! Per-connection processing pipeline
//!
//! One pipeline per byte stream: synchronizer, request correlation and
//! decoder run sequentially on the caller's task. Only the hub is shared.
//! Dropping a pipeline discards its partial frame; device state stays in
//! the hub.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::decoder::{Decoded, RegisterDecoder};
use crate::error::{Result, SnifferCoreError};
use crate::frame::{exception_description, FrameKind, ReadRequest, ValidatedFrame};
use crate::hub::{FrameActivity, SnifferHub};
use crate::register::RegisterTable;
use crate::stats::SnifferStats;
use crate::sync::{FrameSynchronizer, SyncConfig, SyncStats};
use crate::types::RegisterId;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub sync: SyncConfig,
    /// Read requests left unanswered for this long are forgotten
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if self.request_timeout.is_zero() {
            return Err(SnifferCoreError::config(
                "request_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    request: ReadRequest,
    sent_at: Instant,
}

pub struct Pipeline {
    label: String,
    sync: FrameSynchronizer,
    decoder: RegisterDecoder,
    hub: Arc<SnifferHub>,
    stats: Arc<SnifferStats>,
    reported: SyncStats,
    request_timeout: Duration,
    /// Last unanswered read request per bus address
    pending: HashMap<u8, PendingRequest>,
    /// Unknown register ids already logged in this session
    logged_unknown: HashSet<u16>,
}

impl Pipeline {
    pub fn new(
        label: impl Into<String>,
        config: PipelineConfig,
        table: Arc<RegisterTable>,
        hub: Arc<SnifferHub>,
    ) -> Self {
        let stats = hub.stats().clone();
        Self {
            label: label.into(),
            sync: FrameSynchronizer::new(config.sync),
            decoder: RegisterDecoder::new(table),
            hub,
            stats,
            reported: SyncStats::default(),
            request_timeout: config.request_timeout,
            pending: HashMap::new(),
            logged_unknown: HashSet::new(),
        }
    }

    /// Push bytes received at `arrival`; returns the number of frames processed
    pub fn feed(&mut self, data: &[u8], arrival: Instant) -> usize {
        let frames = self.sync.feed(data, arrival);
        let count = frames.len();
        for frame in frames {
            self.process(&frame);
        }
        self.report_sync();
        count
    }

    /// Time-driven work: silence boundaries and request expiry
    pub fn tick(&mut self, now: Instant) -> usize {
        let frames = self.sync.tick(now);
        let count = frames.len();
        for frame in frames {
            self.process(&frame);
        }
        self.expire_requests(now);
        self.report_sync();
        count
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    fn process(&mut self, frame: &ValidatedFrame) {
        let address = frame.address();
        let kind = frame.kind();
        let at = frame.received_at();

        let (anchor, response_time) = self.correlate(address, &kind, at);

        let mut values = Vec::new();
        let mut unknown = Vec::new();
        for item in self.decoder.decode(frame, anchor) {
            match item {
                Decoded::Value(value) => values.push(value),
                Decoded::Unknown(id) => unknown.push(id),
            }
        }
        for id in unknown {
            self.note_unknown(address, id);
        }

        match kind {
            FrameKind::Exception { function, code } => {
                debug!(
                    "[{}] Device {:02X} exception on FC{:02X}: {} ({:#04X})",
                    self.label,
                    address,
                    function,
                    exception_description(code),
                    code
                );
            },
            _ => {
                debug!(
                    "[{}] Device {:02X} {:?}: {} values{}",
                    self.label,
                    address,
                    kind,
                    values.len(),
                    if anchor.is_none() && matches!(kind, FrameKind::ReadResponse { .. }) {
                        " (unanchored)"
                    } else {
                        ""
                    }
                );
            },
        }

        self.hub.ingest(
            address,
            FrameActivity {
                kind,
                response_time,
            },
            values,
            at,
        );
    }

    /// Pair responses with the read request seen for the same address
    fn correlate(&mut self, address: u8, kind: &FrameKind, at: Instant) -> (Option<u16>, Option<Duration>) {
        match *kind {
            FrameKind::ReadRequest(request) => {
                self.pending.insert(
                    address,
                    PendingRequest {
                        request,
                        sent_at: at,
                    },
                );
                (None, None)
            },
            FrameKind::ReadResponse {
                function,
                byte_count,
            } => {
                let Some(pending) = self.pending.remove(&address) else {
                    return (None, None);
                };
                let elapsed = at.saturating_duration_since(pending.sent_at);
                let matches = pending.request.function == function
                    && usize::from(byte_count) == usize::from(pending.request.count) * 2
                    && elapsed <= self.request_timeout;
                if matches {
                    (Some(pending.request.start), Some(elapsed))
                } else {
                    trace!(
                        "[{}] Response from {:02X} does not match pending request {:?}",
                        self.label,
                        address,
                        pending.request
                    );
                    (None, None)
                }
            },
            FrameKind::Exception { .. } => {
                let response_time = self
                    .pending
                    .remove(&address)
                    .map(|pending| at.saturating_duration_since(pending.sent_at));
                (None, response_time)
            },
            _ => (None, None),
        }
    }

    fn note_unknown(&mut self, address: u8, id: RegisterId) {
        self.stats.record_unknown_register();
        let Some(register) = id.address() else {
            return;
        };
        if self.logged_unknown.insert(register) {
            warn!(
                "[{}] Unknown register {} from device {:02X}, skipped",
                self.label, register, address
            );
        } else {
            trace!("[{}] Unknown register {} skipped", self.label, register);
        }
    }

    fn expire_requests(&mut self, now: Instant) {
        let timeout = self.request_timeout;
        self.pending
            .retain(|_, pending| now.saturating_duration_since(pending.sent_at) <= timeout);
    }

    fn report_sync(&mut self) {
        let current = self.sync.stats();
        let delta = current.since(&self.reported);
        if delta != SyncStats::default() {
            self.stats.record_sync(&delta);
        }
        self.reported = current;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let buffered = self.sync.buffered();
        if buffered > 0 {
            debug!("[{}] Pipeline closed, {} buffered bytes discarded", self.label, buffered);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("label", &self.label)
            .field("buffered", &self.sync.buffered())
            .field("pending_requests", &self.pending.len())
            .finish_non_exhaustive()
    }
}
