//! Frame synchronizer
//!
//! Recovers RTU frames from an undelimited byte stream. Three signals decide
//! where a frame starts:
//!
//! - the layout implied by address + function code, checked by CRC
//! - inter-frame silence (t3.5) between chunks, which closes the span
//!   buffered so far
//! - a bounded wait (`sync_timeout`, or the buffer reaching the maximum
//!   frame length) after which the head byte is given up
//!
//! A CRC match alone never makes a frame for a known function code: the
//! span must also have one of the lengths its layout allows. Only unknown
//! function codes are delimited by CRC at any length.
//!
//! When nothing validates at the head of the buffer a single byte is
//! discarded and the search restarts at the next offset.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::constants::{
    BITS_PER_CHAR, DEFAULT_BAUD_RATE, DEFAULT_BUFFER_CAPACITY, FIXED_INTER_FRAME_US,
    FIXED_TIMING_BAUD, INTER_FRAME_CHARS, MAX_FRAME_SIZE, MIN_FRAME_SIZE,
};
use crate::error::{Result, SnifferCoreError};
use crate::frame::{self, CandidateFrame, Evaluation, ValidatedFrame};
use crate::ring_buffer::ByteRingBuffer;

/// Synchronizer tuning
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Serial speed of the tapped bus, used to derive t3.5
    pub baud_rate: u32,
    /// Replaces the computed silence threshold when set
    pub silence_override: Option<Duration>,
    /// How long buffered bytes may wait for a structural frame
    pub sync_timeout: Duration,
    pub max_frame_len: usize,
    pub buffer_capacity: usize,
    /// Log every n-th CRC failure at warn level (the first is always logged)
    pub crc_log_every: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            silence_override: None,
            sync_timeout: Duration::from_millis(500),
            max_frame_len: MAX_FRAME_SIZE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            crc_log_every: 100,
        }
    }
}

impl SyncConfig {
    /// Inter-frame silence that marks a frame boundary
    pub fn silence_threshold(&self) -> Duration {
        if let Some(silence) = self.silence_override {
            return silence;
        }
        if self.baud_rate == 0 || self.baud_rate > FIXED_TIMING_BAUD {
            return Duration::from_micros(FIXED_INTER_FRAME_US);
        }
        let char_secs = f64::from(BITS_PER_CHAR) / f64::from(self.baud_rate);
        Duration::from_secs_f64(INTER_FRAME_CHARS * char_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(SnifferCoreError::config(
                "baud_rate",
                "must be greater than zero",
            ));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.max_frame_len) {
            return Err(SnifferCoreError::config(
                "max_frame_len",
                format!("must be within {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}"),
            ));
        }
        if self.buffer_capacity < self.max_frame_len {
            return Err(SnifferCoreError::config(
                "buffer_capacity",
                "must hold at least one maximum-sized frame",
            ));
        }
        if self.sync_timeout.is_zero() {
            return Err(SnifferCoreError::config(
                "sync_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Synchronizer counters, cumulative since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub bytes_received: u64,
    /// CRC evaluations of candidate frames
    pub frames_attempted: u64,
    pub frames_validated: u64,
    pub crc_failures: u64,
    pub structural_mismatches: u64,
    pub resync_events: u64,
    pub discarded_bytes: u64,
    pub overflow_bytes: u64,
}

impl SyncStats {
    /// Counters accumulated after `earlier` was taken
    pub fn since(&self, earlier: &SyncStats) -> SyncStats {
        SyncStats {
            bytes_received: self.bytes_received.saturating_sub(earlier.bytes_received),
            frames_attempted: self.frames_attempted.saturating_sub(earlier.frames_attempted),
            frames_validated: self.frames_validated.saturating_sub(earlier.frames_validated),
            crc_failures: self.crc_failures.saturating_sub(earlier.crc_failures),
            structural_mismatches: self
                .structural_mismatches
                .saturating_sub(earlier.structural_mismatches),
            resync_events: self.resync_events.saturating_sub(earlier.resync_events),
            discarded_bytes: self.discarded_bytes.saturating_sub(earlier.discarded_bytes),
            overflow_bytes: self.overflow_bytes.saturating_sub(earlier.overflow_bytes),
        }
    }
}

/// Stream-to-frame synchronizer for one byte stream
#[derive(Debug)]
pub struct FrameSynchronizer {
    config: SyncConfig,
    silence: Duration,
    buffer: ByteRingBuffer,
    stats: SyncStats,
    /// False while bytes are being discarded; one resync event per run
    in_sync: bool,
}

impl FrameSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        let silence = config.silence_threshold();
        let buffer = ByteRingBuffer::new(config.buffer_capacity.max(config.max_frame_len));
        debug!(
            "Frame synchronizer: baud={}, silence={:?}, sync_timeout={:?}, max_frame_len={}",
            config.baud_rate, silence, config.sync_timeout, config.max_frame_len
        );
        Self {
            config,
            silence,
            buffer,
            stats: SyncStats::default(),
            in_sync: true,
        }
    }

    /// Push a chunk of bus bytes received at `arrival`, returning every frame
    /// that could be completed.
    pub fn feed(&mut self, data: &[u8], arrival: Instant) -> Vec<ValidatedFrame> {
        let mut frames = Vec::new();
        if data.is_empty() {
            return frames;
        }

        if self.silence_elapsed(arrival) {
            self.close_span(&mut frames);
        }

        self.stats.bytes_received += data.len() as u64;
        let evicted = self.buffer.append(data, arrival);
        if evicted > 0 {
            self.stats.overflow_bytes += evicted as u64;
            warn!("Sniffer buffer overflow, {} oldest bytes dropped", evicted);
        }

        self.extract(arrival, &mut frames);
        frames
    }

    /// Apply time-based boundary handling without new bytes
    pub fn tick(&mut self, now: Instant) -> Vec<ValidatedFrame> {
        let mut frames = Vec::new();
        if self.buffer.is_empty() {
            return frames;
        }

        if self.silence_elapsed(now) {
            self.close_span(&mut frames);
        } else {
            self.extract(now, &mut frames);
        }
        frames
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn silence_threshold(&self) -> Duration {
        self.silence
    }

    /// Bytes waiting for a frame boundary
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn silence_elapsed(&self, now: Instant) -> bool {
        match self.buffer.last_arrival() {
            Some(last) if !self.buffer.is_empty() => {
                now.saturating_duration_since(last) >= self.silence
            },
            _ => false,
        }
    }

    fn waited_too_long(&self, now: Instant) -> bool {
        if self.buffer.len() >= self.config.max_frame_len {
            return true;
        }
        self.buffer
            .front_arrival()
            .is_some_and(|front| now.saturating_duration_since(front) >= self.config.sync_timeout)
    }

    /// Pull frames off the head of the buffer until it needs more bytes
    fn extract(&mut self, now: Instant, frames: &mut Vec<ValidatedFrame>) {
        let max_len = self.config.max_frame_len;

        while self.buffer.len() >= MIN_FRAME_SIZE {
            let mut attempts = 0;
            let evaluation = frame::evaluate(self.buffer.as_slice(), max_len, &mut attempts);
            self.stats.frames_attempted += attempts;

            match evaluation {
                Evaluation::Frame(length) => self.accept(length, frames),
                Evaluation::Rejected { crc_checked } => {
                    if crc_checked {
                        self.record_crc_failure();
                    } else {
                        self.stats.structural_mismatches += 1;
                    }
                    self.discard(1);
                },
                Evaluation::NeedMore | Evaluation::Unstructured => {
                    if evaluation == Evaluation::Unstructured {
                        let mut attempts = 0;
                        let found =
                            frame::scan_any_length(self.buffer.as_slice(), max_len, &mut attempts);
                        self.stats.frames_attempted += attempts;
                        if let Some(length) = found {
                            self.accept(length, frames);
                            continue;
                        }
                    }

                    if let Some(skip) = self.lookahead() {
                        self.discard(skip);
                        continue;
                    }

                    if !self.waited_too_long(now) {
                        break;
                    }

                    // No structure completed in time: the head cannot start a frame
                    self.stats.structural_mismatches += 1;
                    self.discard(1);
                },
            }
        }
    }

    /// Offset of the first structurally complete, CRC-valid frame after the head
    fn lookahead(&mut self) -> Option<usize> {
        let max_len = self.config.max_frame_len;
        let mut attempts = 0;
        let found = {
            let buf = self.buffer.as_slice();
            (1..=buf.len().saturating_sub(MIN_FRAME_SIZE)).find(|&offset| {
                matches!(
                    frame::evaluate(&buf[offset..], max_len, &mut attempts),
                    Evaluation::Frame(_)
                )
            })
        };
        self.stats.frames_attempted += attempts;
        found
    }

    /// Silence closed the current span: sweep it with the sliding window and
    /// drop whatever is left.
    fn close_span(&mut self, frames: &mut Vec<ValidatedFrame>) {
        let max_len = self.config.max_frame_len;
        let mut attempts = 0;
        let mut candidates = Vec::new();
        let mut skipped = 0usize;

        {
            let buf = self.buffer.as_slice();
            let mut offset = 0;
            while buf.len() - offset >= MIN_FRAME_SIZE {
                let rest = &buf[offset..];
                let length = match frame::evaluate(rest, max_len, &mut attempts) {
                    Evaluation::Frame(length) => Some(length),
                    _ => frame::scan_any_length(rest, max_len, &mut attempts),
                };
                match length {
                    Some(length) => {
                        candidates.push(CandidateFrame {
                            start_offset: offset,
                            length,
                        });
                        offset += length;
                    },
                    None => {
                        skipped += 1;
                        offset += 1;
                    },
                }
            }
            skipped += buf.len() - offset;
        }
        self.stats.frames_attempted += attempts;

        let mut recovered = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let end = candidate.start_offset + candidate.length;
            let Some(arrival) = self.buffer.arrival_of(end - 1) else {
                continue;
            };
            let bytes = &self.buffer.as_slice()[candidate.start_offset..end];
            if let Some(frame) = ValidatedFrame::try_new(bytes, arrival) {
                trace!("Frame recovered at silence boundary: {:?}", frame);
                recovered.push(frame);
            }
        }

        self.buffer.clear();
        self.stats.frames_validated += recovered.len() as u64;
        frames.extend(recovered);

        if skipped > 0 {
            self.stats.discarded_bytes += skipped as u64;
            self.stats.resync_events += 1;
            self.in_sync = false;
            debug!("Silence boundary discarded {} unframed bytes", skipped);
        }
        if !candidates.is_empty() {
            self.in_sync = true;
        }
    }

    fn accept(&mut self, length: usize, frames: &mut Vec<ValidatedFrame>) {
        let arrival = self.buffer.arrival_of(length - 1);
        let frame = arrival.and_then(|at| ValidatedFrame::try_new(self.buffer.peek(length), at));

        match frame {
            Some(frame) => {
                self.buffer.consume(length);
                self.stats.frames_validated += 1;
                self.in_sync = true;
                trace!("Frame validated: {:?}", frame);
                frames.push(frame);
            },
            None => {
                self.record_crc_failure();
                self.discard(1);
            },
        }
    }

    fn discard(&mut self, n: usize) {
        let removed = self.buffer.consume(n);
        self.stats.discarded_bytes += removed as u64;
        if self.in_sync {
            self.in_sync = false;
            self.stats.resync_events += 1;
            debug!("Lost frame sync, resynchronizing");
        }
    }

    fn record_crc_failure(&mut self) {
        self.stats.crc_failures += 1;
        let count = self.stats.crc_failures;
        let every = self.config.crc_log_every.max(1);
        if count == 1 || count % every == 0 {
            warn!("CRC mismatch on candidate frame (total CRC failures: {})", count);
        } else {
            trace!("CRC mismatch on candidate frame (total CRC failures: {})", count);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const RESPONSE: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0x64, 0xB9, 0xAF];
    const REQUEST: [u8; 8] = [0x01, 0x03, 0x08, 0x3E, 0x00, 0x04, 0x27, 0xA5];
    const RESPONSE_ADDR2: [u8; 7] = [0x02, 0x03, 0x02, 0x00, 0x2A, 0x7D, 0x9B];

    fn synchronizer() -> FrameSynchronizer {
        FrameSynchronizer::new(SyncConfig::default())
    }

    #[test]
    fn test_silence_threshold_from_baud() {
        let config = SyncConfig::default();
        // 3.5 * 11 / 9600 s
        let micros = config.silence_threshold().as_micros();
        assert!((4000..=4020).contains(&micros), "got {micros}us");

        let fast = SyncConfig {
            baud_rate: 115_200,
            ..SyncConfig::default()
        };
        assert_eq!(fast.silence_threshold(), Duration::from_micros(1750));

        let overridden = SyncConfig {
            silence_override: Some(Duration::from_millis(20)),
            ..SyncConfig::default()
        };
        assert_eq!(overridden.silence_threshold(), Duration::from_millis(20));
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());

        let zero_baud = SyncConfig {
            baud_rate: 0,
            ..SyncConfig::default()
        };
        assert!(zero_baud.validate().is_err());

        let oversized = SyncConfig {
            max_frame_len: 300,
            ..SyncConfig::default()
        };
        assert!(oversized.validate().is_err());

        let small_buffer = SyncConfig {
            buffer_capacity: 100,
            ..SyncConfig::default()
        };
        assert!(small_buffer.validate().is_err());
    }

    #[test]
    fn test_single_frame() {
        let mut sync = synchronizer();
        let frames = sync.feed(&RESPONSE, Instant::now());

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &RESPONSE);
        assert_eq!(sync.buffered(), 0);
        assert_eq!(sync.stats().frames_validated, 1);
        assert_eq!(sync.stats().bytes_received, 7);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut sync = synchronizer();
        let t0 = Instant::now();

        assert!(sync.feed(&RESPONSE[..3], t0).is_empty());
        let frames = sync.feed(&RESPONSE[3..], t0 + Duration::from_millis(1));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].received_at(), t0 + Duration::from_millis(1));
    }

    #[test]
    fn test_request_and_response_back_to_back() {
        let mut sync = synchronizer();
        let mut stream = REQUEST.to_vec();
        stream.extend_from_slice(&RESPONSE_ADDR2);

        let frames = sync.feed(&stream, Instant::now());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].address(), 1);
        assert_eq!(frames[1].address(), 2);
    }

    #[test]
    fn test_leading_garbage_is_discarded() {
        let mut sync = synchronizer();
        let mut stream = vec![0xFF, 0xFE, 0xFA];
        stream.extend_from_slice(&RESPONSE);

        let frames = sync.feed(&stream, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(sync.stats().discarded_bytes, 3);
        assert_eq!(sync.stats().resync_events, 1);
        assert_eq!(sync.stats().structural_mismatches, 3);
    }

    #[test]
    fn test_crc_failure_resyncs() {
        let mut sync = synchronizer();
        let mut corrupted = REQUEST;
        corrupted[4] ^= 0x10;
        let mut stream = corrupted.to_vec();
        stream.extend_from_slice(&RESPONSE);

        let frames = sync.feed(&stream, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &RESPONSE);
        assert!(sync.stats().crc_failures >= 1);
        assert_eq!(sync.stats().discarded_bytes, 8);
    }

    #[test]
    fn test_silence_drops_torn_frame() {
        let mut sync = synchronizer();
        let t0 = Instant::now();

        // Half a response, then the bus goes quiet
        assert!(sync.feed(&RESPONSE[..4], t0).is_empty());
        let frames = sync.feed(&RESPONSE, t0 + Duration::from_millis(50));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &RESPONSE);
        assert_eq!(sync.stats().discarded_bytes, 4);
    }

    #[test]
    fn test_tick_closes_span_after_silence() {
        let mut sync = synchronizer();
        let t0 = Instant::now();

        sync.feed(&RESPONSE[..5], t0);
        assert_eq!(sync.buffered(), 5);

        assert!(sync.tick(t0 + Duration::from_millis(1)).is_empty());
        assert_eq!(sync.buffered(), 5);

        assert!(sync.tick(t0 + Duration::from_millis(10)).is_empty());
        assert_eq!(sync.buffered(), 0);
        assert_eq!(sync.stats().discarded_bytes, 5);
    }

    #[test]
    fn test_lookahead_skips_stuck_head() {
        let mut sync = FrameSynchronizer::new(SyncConfig {
            silence_override: Some(Duration::from_secs(10)),
            ..SyncConfig::default()
        });
        // 0x01 0x03 0x40 announces a 69-byte response that never comes
        let mut stream = vec![0x01, 0x03, 0x40];
        stream.extend_from_slice(&RESPONSE);

        let frames = sync.feed(&stream, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &RESPONSE);
        assert_eq!(sync.stats().discarded_bytes, 3);
    }

    #[test]
    fn test_sync_timeout_gives_up_stuck_head() {
        let mut sync = FrameSynchronizer::new(SyncConfig {
            silence_override: Some(Duration::from_secs(10)),
            ..SyncConfig::default()
        });
        let t0 = Instant::now();

        // A read header whose announced response never completes
        sync.feed(&[0x01, 0x03, 0x40, 0x00, 0x00], t0);
        assert_eq!(sync.buffered(), 5);

        assert!(sync.tick(t0 + Duration::from_millis(600)).is_empty());
        assert!(sync.buffered() < MIN_FRAME_SIZE);
        assert!(sync.stats().structural_mismatches >= 1);
    }

    /// CRC-valid, but 7 bytes cannot hold a response announcing 4 data bytes
    const INCONSISTENT_RESPONSE: [u8; 7] = [0x01, 0x03, 0x04, 0x00, 0x64, 0x59, 0xAE];

    #[test]
    fn test_crc_match_with_wrong_byte_count_at_silence() {
        let mut sync = synchronizer();
        let t0 = Instant::now();

        assert!(sync.feed(&INCONSISTENT_RESPONSE, t0).is_empty());
        assert!(sync.tick(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(sync.buffered(), 0);
        assert_eq!(sync.stats().frames_validated, 0);
        assert_eq!(sync.stats().discarded_bytes, 7);
    }

    #[test]
    fn test_crc_match_with_wrong_byte_count_after_timeout() {
        let mut sync = FrameSynchronizer::new(SyncConfig {
            silence_override: Some(Duration::from_secs(10)),
            ..SyncConfig::default()
        });
        let t0 = Instant::now();

        assert!(sync.feed(&INCONSISTENT_RESPONSE, t0).is_empty());
        assert!(sync.tick(t0 + Duration::from_millis(600)).is_empty());
        assert_eq!(sync.stats().frames_validated, 0);
        assert!(sync.buffered() < MIN_FRAME_SIZE);
    }

    #[test]
    fn test_unknown_function_code_frame() {
        let mut sync = synchronizer();
        let mut vendor = vec![0x05, 0x41, 0xAA, 0xBB, 0xCC];
        crate::crc::append(&mut vendor);

        let frames = sync.feed(&vendor, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function_code(), 0x41);
    }

    #[test]
    fn test_stats_since() {
        let earlier = SyncStats {
            bytes_received: 10,
            frames_validated: 1,
            ..SyncStats::default()
        };
        let later = SyncStats {
            bytes_received: 25,
            frames_validated: 3,
            crc_failures: 1,
            ..SyncStats::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.bytes_received, 15);
        assert_eq!(delta.frames_validated, 2);
        assert_eq!(delta.crc_failures, 1);
    }
}
