//! Modbus RTU constants used by the sniffer
//!
//! Frame limits follow the Modbus over serial line standard:
//! RS485 ADU is at most 256 bytes (address + 253-byte PDU + 2-byte CRC).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Smallest RTU frame: address(1) + function code(1) + CRC(2)
pub const MIN_FRAME_SIZE: usize = 4;

/// Largest RTU frame allowed on a serial line (RS485 ADU limit)
pub const MAX_FRAME_SIZE: usize = 256;

/// Length of the trailing CRC field
pub const CRC_LEN: usize = 2;

/// Default ring buffer capacity, two maximum-sized frames
pub const DEFAULT_BUFFER_CAPACITY: usize = 512;

/// Length of a read request and of every fixed-size write frame
/// address(1) + fc(1) + start(2) + count/value(2) + crc(2)
pub const FIXED_FRAME_LEN: usize = 8;

/// Length of an exception response: address(1) + fc(1) + code(1) + crc(2)
pub const EXCEPTION_FRAME_LEN: usize = 5;

// ============================================================================
// Bus Addressing
// ============================================================================

/// Broadcast address, only meaningful for write requests
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest assignable slave address (248..=255 are reserved)
pub const MAX_SLAVE_ADDRESS: u8 = 247;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// High bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Serial Timing
// ============================================================================

/// Bits per character on an RTU line: start + 8 data + parity/stop + stop
pub const BITS_PER_CHAR: u32 = 11;

/// Inter-frame silence in character times (t3.5)
pub const INTER_FRAME_CHARS: f64 = 3.5;

/// Above this baud rate Modbus fixes t3.5 at 1.75 ms
pub const FIXED_TIMING_BAUD: u32 = 19_200;

/// Fixed t3.5 for baud rates above 19200, in microseconds
pub const FIXED_INTER_FRAME_US: u64 = 1_750;

/// Default serial speed of the heat-pump bus
pub const DEFAULT_BAUD_RATE: u32 = 9_600;
