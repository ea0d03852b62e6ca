//! Bounded byte buffer between the listener and the frame synchronizer
//!
//! Bytes are kept with the arrival time of the chunk they came in, which the
//! synchronizer needs to reason about inter-frame silence. When the buffer is
//! full the oldest bytes are evicted and counted; nothing is validated here.

use std::collections::VecDeque;
use std::time::Instant;

/// Arrival stamp covering `len` consecutive bytes
#[derive(Debug, Clone, Copy)]
struct ChunkStamp {
    len: usize,
    arrival: Instant,
}

/// Bounded FIFO of raw bus bytes
#[derive(Debug)]
pub struct ByteRingBuffer {
    bytes: VecDeque<u8>,
    stamps: VecDeque<ChunkStamp>,
    capacity: usize,
    overflow_bytes: u64,
}

impl ByteRingBuffer {
    /// Create a buffer holding at most `capacity` bytes (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: VecDeque::with_capacity(capacity),
            stamps: VecDeque::new(),
            capacity,
            overflow_bytes: 0,
        }
    }

    /// Append a chunk received at `arrival`.
    ///
    /// Returns the number of bytes evicted to make room (0 when the buffer
    /// kept up).
    pub fn append(&mut self, data: &[u8], arrival: Instant) -> usize {
        if data.is_empty() {
            return 0;
        }

        // A chunk larger than the whole buffer only leaves its tail
        let (skipped, data) = if data.len() > self.capacity {
            let skip = data.len() - self.capacity;
            (skip, &data[skip..])
        } else {
            (0, data)
        };

        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        self.drop_front(overflow);

        self.bytes.extend(data.iter().copied());
        self.stamps.push_back(ChunkStamp {
            len: data.len(),
            arrival,
        });

        let evicted = skipped + overflow;
        self.overflow_bytes += evicted as u64;
        evicted
    }

    /// Inspect up to `n` leading bytes without consuming them
    pub fn peek(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.bytes.len());
        &self.bytes.make_contiguous()[..n]
    }

    /// Contiguous view of everything buffered
    pub fn as_slice(&mut self) -> &[u8] {
        self.bytes.make_contiguous()
    }

    /// Discard up to `n` leading bytes, returning how many were removed
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.bytes.len());
        self.drop_front(n);
        n
    }

    /// Discard everything, returning how many bytes were removed
    pub fn clear(&mut self) -> usize {
        let n = self.bytes.len();
        self.bytes.clear();
        self.stamps.clear();
        n
    }

    /// Arrival time of the oldest buffered byte
    pub fn front_arrival(&self) -> Option<Instant> {
        self.stamps.front().map(|s| s.arrival)
    }

    /// Arrival time of the newest buffered byte
    pub fn last_arrival(&self) -> Option<Instant> {
        self.stamps.back().map(|s| s.arrival)
    }

    /// Arrival time of the chunk holding the byte at `index`
    pub fn arrival_of(&self, index: usize) -> Option<Instant> {
        let mut end = 0;
        for stamp in &self.stamps {
            end += stamp.len;
            if index < end {
                return Some(stamp.arrival);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes evicted because the buffer was full
    pub fn overflow_count(&self) -> u64 {
        self.overflow_bytes
    }

    fn drop_front(&mut self, mut n: usize) {
        self.bytes.drain(..n.min(self.bytes.len()));
        while n > 0 {
            let Some(front) = self.stamps.front_mut() else {
                break;
            };
            if front.len > n {
                front.len -= n;
                break;
            }
            n -= front.len;
            self.stamps.pop_front();
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_append_and_peek() {
        let mut buffer = ByteRingBuffer::new(16);
        let now = Instant::now();

        assert_eq!(buffer.append(&[1, 2, 3], now), 0);
        assert_eq!(buffer.append(&[4, 5], now), 0);

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.peek(3), &[1, 2, 3]);
        assert_eq!(buffer.peek(100), &[1, 2, 3, 4, 5]);
        // peek does not consume
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_consume_partial() {
        let mut buffer = ByteRingBuffer::new(16);
        buffer.append(&[1, 2, 3, 4], Instant::now());

        assert_eq!(buffer.consume(3), 3);
        assert_eq!(buffer.as_slice(), &[4]);
        assert_eq!(buffer.consume(10), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buffer = ByteRingBuffer::new(4);
        let now = Instant::now();

        buffer.append(&[1, 2, 3], now);
        let evicted = buffer.append(&[4, 5, 6], now);

        assert_eq!(evicted, 2);
        assert_eq!(buffer.as_slice(), &[3, 4, 5, 6]);
        assert_eq!(buffer.overflow_count(), 2);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut buffer = ByteRingBuffer::new(3);
        buffer.append(&[9], Instant::now());

        let evicted = buffer.append(&[1, 2, 3, 4, 5], Instant::now());

        assert_eq!(evicted, 3);
        assert_eq!(buffer.as_slice(), &[3, 4, 5]);
        assert_eq!(buffer.overflow_count(), 3);
    }

    #[test]
    fn test_arrival_stamps_follow_consumption() {
        let mut buffer = ByteRingBuffer::new(16);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(20);

        buffer.append(&[1, 2], t0);
        buffer.append(&[3, 4, 5], t1);
        assert_eq!(buffer.front_arrival(), Some(t0));
        assert_eq!(buffer.last_arrival(), Some(t1));

        buffer.consume(1);
        assert_eq!(buffer.front_arrival(), Some(t0));

        buffer.consume(1);
        assert_eq!(buffer.front_arrival(), Some(t1));
        assert_eq!(buffer.arrival_of(2), Some(t1));
        assert_eq!(buffer.arrival_of(3), None);

        buffer.clear();
        assert_eq!(buffer.front_arrival(), None);
    }

    #[test]
    fn test_empty_append_is_ignored() {
        let mut buffer = ByteRingBuffer::new(4);
        assert_eq!(buffer.append(&[], Instant::now()), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_arrival(), None);
    }
}
