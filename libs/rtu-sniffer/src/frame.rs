//! RTU frame structure
//!
//! Two jobs live here: predicting how long a frame starting at a given byte
//! must be (used by the synchronizer before any CRC is computed) and
//! classifying a frame once its CRC has been validated.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::constants::{
    BROADCAST_ADDRESS, CRC_LEN, EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FC_READ_COILS,
    FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, FIXED_FRAME_LEN, MAX_SLAVE_ADDRESS, MIN_FRAME_SIZE,
};
use crate::crc;

/// A span of the synchronizer's buffer hypothesized to hold one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateFrame {
    pub start_offset: usize,
    pub length: usize,
}

/// A frame whose trailing CRC matched. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatedFrame {
    bytes: Bytes,
    received_at: Instant,
}

impl ValidatedFrame {
    /// Validate `data` as a complete RTU frame.
    ///
    /// Returns `None` when the frame is shorter than the RTU minimum or its
    /// CRC does not match.
    pub fn try_new(data: &[u8], received_at: Instant) -> Option<Self> {
        if !crc::verify(data) {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(data),
            received_at,
        })
    }

    /// Slave address the frame is addressed to (requests) or sent from (responses)
    pub fn address(&self) -> u8 {
        self.bytes[0]
    }

    pub fn function_code(&self) -> u8 {
        self.bytes[1]
    }

    /// Bytes between the function code and the CRC
    pub fn data(&self) -> &[u8] {
        &self.bytes[2..self.bytes.len() - CRC_LEN]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Arrival time of the chunk that completed the frame
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::classify(&self.bytes)
    }
}

impl fmt::Debug for ValidatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatedFrame[")?;
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        write!(f, "]")
    }
}

/// A read request as seen on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub function: u8,
    pub start: u16,
    pub count: u16,
}

/// What a validated frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    ReadRequest(ReadRequest),
    ReadResponse { function: u8, byte_count: u8 },
    /// FC05/FC06 request, or its identical echo response
    WriteSingle { function: u8, register: u16, value: u16 },
    WriteMultipleRequest { function: u8, start: u16, count: u16 },
    WriteMultipleResponse { function: u8, start: u16, count: u16 },
    Exception { function: u8, code: u8 },
    Other { function: u8 },
}

impl FrameKind {
    /// Classify a CRC-valid frame by function code and length
    pub fn classify(frame: &[u8]) -> Self {
        if frame.len() < MIN_FRAME_SIZE {
            return FrameKind::Other { function: 0 };
        }

        let function = frame[1];
        let len = frame.len();
        let word = |at: usize| u16::from_be_bytes([frame[at], frame[at + 1]]);

        if function & EXCEPTION_FLAG != 0 {
            return if len == EXCEPTION_FRAME_LEN {
                FrameKind::Exception {
                    function: function & !EXCEPTION_FLAG,
                    code: frame[2],
                }
            } else {
                FrameKind::Other { function }
            };
        }

        match function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS => {
                if len == FIXED_FRAME_LEN {
                    FrameKind::ReadRequest(ReadRequest {
                        function,
                        start: word(2),
                        count: word(4),
                    })
                } else if len == 5 + usize::from(frame[2]) {
                    FrameKind::ReadResponse {
                        function,
                        byte_count: frame[2],
                    }
                } else {
                    FrameKind::Other { function }
                }
            },
            FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER if len == FIXED_FRAME_LEN => {
                FrameKind::WriteSingle {
                    function,
                    register: word(2),
                    value: word(4),
                }
            },
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
                if len == FIXED_FRAME_LEN {
                    FrameKind::WriteMultipleResponse {
                        function,
                        start: word(2),
                        count: word(4),
                    }
                } else if len >= 9 && len == 9 + usize::from(frame[6]) {
                    FrameKind::WriteMultipleRequest {
                        function,
                        start: word(2),
                        count: word(4),
                    }
                } else {
                    FrameKind::Other { function }
                }
            },
            _ => FrameKind::Other { function },
        }
    }

    /// True for frames sent by the bus master
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            FrameKind::ReadRequest(_)
                | FrameKind::WriteSingle { .. }
                | FrameKind::WriteMultipleRequest { .. }
        )
    }

    /// True for frames sent by a slave
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            FrameKind::ReadResponse { .. }
                | FrameKind::WriteMultipleResponse { .. }
                | FrameKind::Exception { .. }
        )
    }
}

/// Get exception description
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

// ============================================================================
// Structural length prediction
// ============================================================================

/// Outcome of trying to read one frame at the start of a byte slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Evaluation {
    /// A CRC-valid frame of this length starts here
    Frame(usize),
    /// Nothing starting here can be a frame
    Rejected { crc_checked: bool },
    /// A layout fits but needs more bytes than are buffered
    NeedMore,
    /// Function code without a known layout
    Unstructured,
}

/// What the address and function code say about a frame's length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Address and function code are not buffered yet
    Partial,
    /// The first bytes cannot start a frame
    Invalid,
    /// Function code without a known layout; only a CRC can delimit it
    Unstructured,
    /// Up to two structurally possible lengths (request and response
    /// shapes). `pending` is set while a length field is still missing.
    Known {
        lengths: [Option<usize>; 2],
        pending: bool,
    },
}

impl Layout {
    fn of(buf: &[u8]) -> Self {
        if buf.len() < 2 {
            return Layout::Partial;
        }

        let address = buf[0];
        let function = buf[1];

        if address > MAX_SLAVE_ADDRESS {
            return Layout::Invalid;
        }

        let is_write = matches!(
            function,
            FC_WRITE_SINGLE_COIL
                | FC_WRITE_SINGLE_REGISTER
                | FC_WRITE_MULTIPLE_COILS
                | FC_WRITE_MULTIPLE_REGISTERS
        );
        if address == BROADCAST_ADDRESS && !is_write {
            return Layout::Invalid;
        }

        let field = |at: usize| buf.get(at).copied().map(usize::from);
        let known = |request: usize, other: Option<Option<usize>>| Layout::Known {
            lengths: [Some(request), other.flatten()],
            pending: other.is_none(),
        };

        if function & EXCEPTION_FLAG != 0 {
            let base = function & !EXCEPTION_FLAG;
            if base == 0 || base > 0x2B {
                return Layout::Invalid;
            }
            return known(EXCEPTION_FRAME_LEN, Some(None));
        }

        match function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => known(
                FIXED_FRAME_LEN,
                field(2).map(|count| (count != 0).then_some(5 + count)),
            ),
            // Register reads always return whole 16-bit words
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => known(
                FIXED_FRAME_LEN,
                field(2).map(|count| (count != 0 && count % 2 == 0).then_some(5 + count)),
            ),
            FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => known(FIXED_FRAME_LEN, Some(None)),
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => known(
                FIXED_FRAME_LEN,
                field(6).map(|count| {
                    let odd_words = function == FC_WRITE_MULTIPLE_REGISTERS && count % 2 != 0;
                    (count != 0 && !odd_words).then_some(9 + count)
                }),
            ),
            _ => Layout::Unstructured,
        }
    }
}

/// Try to read one frame at the start of `buf` using the layout implied by
/// its function code. Every CRC computed bumps `attempts`.
pub(crate) fn evaluate(buf: &[u8], max_len: usize, attempts: &mut u64) -> Evaluation {
    let (lengths, mut pending) = match Layout::of(buf) {
        Layout::Partial => return Evaluation::NeedMore,
        Layout::Invalid => return Evaluation::Rejected { crc_checked: false },
        Layout::Unstructured => return Evaluation::Unstructured,
        Layout::Known { lengths, pending } => (lengths, pending),
    };

    let mut exact: Vec<usize> = lengths
        .into_iter()
        .flatten()
        .filter(|len| (MIN_FRAME_SIZE..=max_len).contains(len))
        .collect();
    exact.sort_unstable();
    exact.dedup();

    let mut crc_checked = false;
    for len in exact {
        if len > buf.len() {
            pending = true;
            continue;
        }
        *attempts += 1;
        crc_checked = true;
        if crc::verify(&buf[..len]) {
            return Evaluation::Frame(len);
        }
    }

    if pending {
        Evaluation::NeedMore
    } else {
        Evaluation::Rejected { crc_checked }
    }
}

/// Layout-free search for frames with an unknown function code: the
/// shortest length in `MIN_FRAME_SIZE..=max_len` whose CRC validates at the
/// start of `buf`. A known function code only ever matches at its
/// structural lengths, so it yields `None` here.
pub(crate) fn scan_any_length(buf: &[u8], max_len: usize, attempts: &mut u64) -> Option<usize> {
    if Layout::of(buf) != Layout::Unstructured {
        return None;
    }
    let upper = max_len.min(buf.len());
    (MIN_FRAME_SIZE..=upper).find(|&len| {
        *attempts += 1;
        crc::verify(&buf[..len])
    })
}
