//! Modbus CRC16
//!
//! Polynomial 0xA001 (reflected 0x8005), initial register 0xFFFF, transmitted
//! low byte first.

use crate::constants::{CRC_LEN, MIN_FRAME_SIZE};

/// Calculate CRC16 checksum (Modbus RTU standard)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Check that the trailing two bytes of `frame` are the CRC of everything
/// before them. Frames shorter than the RTU minimum never validate.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < MIN_FRAME_SIZE {
        return false;
    }

    let split = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    crc16(&frame[..split]) == received
}

/// Append the CRC of `frame` to it, low byte first.
pub fn append(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/MODBUS catalogue check value
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_read_request_vector() {
        // Read 1 holding register at 0 from slave 1: 01 03 00 00 00 01 84 0A
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(crc.to_le_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_verify_valid_frame() {
        assert!(verify(&[0x01, 0x03, 0x02, 0x00, 0x64, 0xB9, 0xAF]));
        assert!(verify(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]));
    }

    #[test]
    fn test_verify_rejects_swapped_crc_bytes() {
        assert!(!verify(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x0A, 0x84]));
    }

    #[test]
    fn test_verify_rejects_short_input() {
        assert!(!verify(&[]));
        assert!(!verify(&[0xFF, 0xFF]));
        assert!(!verify(&[0x01, 0x40, 0xBF]));
    }

    #[test]
    fn test_any_single_byte_corruption_is_detected() {
        let frame = [0x01, 0x03, 0x08, 0x13, 0x88, 0xFF, 0xFF, 0x1B, 0x58, 0x19, 0x64, 0x51, 0x91];
        assert!(verify(&frame));

        for index in 0..frame.len() {
            for flip in 1..=255u8 {
                let mut corrupted = frame;
                corrupted[index] ^= flip;
                assert!(
                    !verify(&corrupted),
                    "corruption at byte {index} with mask {flip:#04X} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_append_produces_verifiable_frame() {
        let mut frame = vec![0x01, 0x06, 0x07, 0xDF, 0x13, 0x88];
        append(&mut frame);
        assert_eq!(&frame[6..], &[0xB4, 0x12]);
        assert!(verify(&frame));
    }
}
