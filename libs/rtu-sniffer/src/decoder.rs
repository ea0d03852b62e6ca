//! Register decoder
//!
//! A pure projection from a validated frame to typed register values. The
//! returned iterator is lazy and borrows both the frame and the table; it
//! never touches shared state. Register ids the table does not know are
//! reported as [`Decoded::Unknown`] so the caller decides how to log them.

use std::sync::Arc;
use std::time::Instant;

use crate::constants::{
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::frame::{FrameKind, ValidatedFrame};
use crate::register::{RegisterKind, RegisterTable};
use crate::types::{PhysicalValue, RegisterId, RegisterValue};

/// One item produced while decoding a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(RegisterValue),
    /// Register carried by the frame but absent from the table
    Unknown(RegisterId),
}

#[derive(Debug, Clone)]
pub struct RegisterDecoder {
    table: Arc<RegisterTable>,
}

impl RegisterDecoder {
    pub fn new(table: Arc<RegisterTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<RegisterTable> {
        &self.table
    }

    /// Decode the registers carried by `frame`.
    ///
    /// `anchor` is the start register of the read request this frame answers,
    /// if one was correlated. Without it read-response words are reported by
    /// position. Write requests carry their own addresses and ignore it.
    pub fn decode<'a>(&'a self, frame: &'a ValidatedFrame, anchor: Option<u16>) -> DecodedValues<'a> {
        let data = frame.data();
        let (payload, base): (&[u8], Option<u16>) = match frame.kind() {
            FrameKind::ReadResponse { function, byte_count }
                if function == FC_READ_HOLDING_REGISTERS || function == FC_READ_INPUT_REGISTERS =>
            {
                (&data[1..1 + usize::from(byte_count)], anchor)
            },
            FrameKind::WriteSingle {
                function: FC_WRITE_SINGLE_REGISTER,
                register,
                ..
            } => (&data[2..4], Some(register)),
            FrameKind::WriteMultipleRequest {
                function: FC_WRITE_MULTIPLE_REGISTERS,
                start,
                count,
            } => {
                let words = usize::from(count).min(usize::from(data[4]) / 2);
                (&data[5..5 + words * 2], Some(start))
            },
            _ => (&[], None),
        };

        DecodedValues {
            table: &self.table,
            payload,
            base,
            index: 0,
            timestamp: frame.received_at(),
        }
    }
}

/// Lazy, single-pass sequence of decoded registers for one frame
#[derive(Debug)]
pub struct DecodedValues<'a> {
    table: &'a RegisterTable,
    /// Big-endian register words
    payload: &'a [u8],
    base: Option<u16>,
    index: usize,
    timestamp: Instant,
}

impl DecodedValues<'_> {
    fn word_count(&self) -> usize {
        self.payload.len() / 2
    }

    fn word(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.payload[index * 2], self.payload[index * 2 + 1]])
    }
}

impl Iterator for DecodedValues<'_> {
    type Item = Decoded;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.word_count();
        if self.index >= total {
            return None;
        }
        let index = self.index;

        let Some(base) = self.base else {
            self.index += 1;
            let raw = i64::from(self.word(index));
            return Some(Decoded::Value(RegisterValue {
                register_id: RegisterId::Offset(index as u16),
                kind: RegisterKind::Counter,
                raw_value: raw,
                physical_value: PhysicalValue::Integer(raw),
                unit: None,
                timestamp: self.timestamp,
            }));
        };

        let Some(address) = base.checked_add(index as u16) else {
            self.index = total;
            return None;
        };
        let id = RegisterId::Address(address);

        let Some(definition) = self.table.get(address) else {
            self.index += 1;
            return Some(Decoded::Unknown(id));
        };

        let width = definition.width.words();
        if index + width > total {
            // 32-bit register cut off by the end of the frame
            self.index = total;
            return Some(Decoded::Unknown(id));
        }

        let words: Vec<u16> = (index..index + width).map(|i| self.word(i)).collect();
        self.index += width;

        let Some(raw) = definition.raw_from_words(&words) else {
            return Some(Decoded::Unknown(id));
        };

        Some(Decoded::Value(RegisterValue {
            register_id: id,
            kind: definition.kind,
            raw_value: raw,
            physical_value: definition.physical(raw),
            unit: definition.unit.clone(),
            timestamp: self.timestamp,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.word_count().saturating_sub(self.index)))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::crc;
    use crate::register::RegisterDefinition;

    fn frame(bytes: &[u8]) -> ValidatedFrame {
        ValidatedFrame::try_new(bytes, Instant::now()).unwrap()
    }

    fn framed(body: &[u8]) -> ValidatedFrame {
        let mut bytes = body.to_vec();
        crc::append(&mut bytes);
        frame(&bytes)
    }

    fn quatt_decoder() -> RegisterDecoder {
        RegisterDecoder::new(Arc::new(RegisterTable::quatt().unwrap()))
    }

    fn values(items: impl Iterator<Item = Decoded>) -> Vec<RegisterValue> {
        items
            .filter_map(|item| match item {
                Decoded::Value(value) => Some(value),
                Decoded::Unknown(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_anchored_read_response() {
        let decoder = quatt_decoder();
        let response = frame(&[
            0x01, 0x03, 0x08, 0x13, 0x88, 0xFF, 0xFF, 0x1B, 0x58, 0x19, 0x64, 0x51, 0x91,
        ]);

        let decoded = values(decoder.decode(&response, Some(2110)));
        assert_eq!(decoded.len(), 4);

        assert_eq!(decoded[0].register_id, RegisterId::Address(2110));
        assert_eq!(decoded[0].raw_value, 5000);
        assert_eq!(decoded[0].physical_value, PhysicalValue::Number(20.0));
        assert_eq!(decoded[0].unit.as_deref(), Some("°C"));

        // 0xFFFF is -1 on a signed register, then offset and clamp apply
        assert_eq!(decoded[1].raw_value, -1);
        assert_eq!(decoded[1].physical_value, PhysicalValue::Number(-30.0));

        assert_eq!(decoded[3].register_id, RegisterId::Address(2113));
    }

    #[test]
    fn test_unanchored_read_response() {
        let decoder = quatt_decoder();
        let response = frame(&[0x01, 0x03, 0x02, 0x00, 0x64, 0xB9, 0xAF]);

        let decoded = values(decoder.decode(&response, None));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].register_id, RegisterId::Offset(0));
        assert_eq!(decoded[0].raw_value, 100);
        assert_eq!(decoded[0].physical_value, PhysicalValue::Integer(100));
    }

    #[test]
    fn test_unknown_registers_are_reported_and_skipped() {
        let decoder = quatt_decoder();
        // 2105..=2107, 2106 is not mapped
        let response = framed(&[0x01, 0x03, 0x06, 0x03, 0xE8, 0x00, 0x01, 0x00, 0x10]);

        let items: Vec<Decoded> = decoder.decode(&response, Some(2105)).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], Decoded::Unknown(RegisterId::Address(2106)));
        match &items[2] {
            Decoded::Value(value) => {
                assert_eq!(value.register_id, RegisterId::Address(2107));
                assert_eq!(value.raw_value, 16);
            },
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[test]
    fn test_write_single_register() {
        let decoder = quatt_decoder();
        let write = frame(&[0x01, 0x06, 0x07, 0xDF, 0x13, 0x88, 0xB4, 0x12]);

        let decoded = values(decoder.decode(&write, None));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].register_id, RegisterId::Address(2015));
        let percent = decoded[0].physical_value.as_f64().unwrap();
        assert!((percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_write_multiple_registers() {
        let decoder = quatt_decoder();
        // Write 1999 = 3 and 2000 = 7 (2000 is not mapped)
        let write = framed(&[0x01, 0x10, 0x07, 0xCF, 0x00, 0x02, 0x04, 0x00, 0x03, 0x00, 0x07]);

        let items: Vec<Decoded> = decoder.decode(&write, None).collect();
        assert_eq!(items.len(), 2);
        match &items[0] {
            Decoded::Value(value) => assert_eq!(value.physical_value, PhysicalValue::Integer(3)),
            other => panic!("expected a value, got {other:?}"),
        }
        assert_eq!(items[1], Decoded::Unknown(RegisterId::Address(2000)));
    }

    #[test]
    fn test_requests_and_exceptions_carry_no_values() {
        let decoder = quatt_decoder();
        let request = frame(&[0x01, 0x03, 0x08, 0x3E, 0x00, 0x04, 0x27, 0xA5]);
        assert_eq!(decoder.decode(&request, None).count(), 0);

        let exception = framed(&[0x01, 0x83, 0x02]);
        assert_eq!(decoder.decode(&exception, Some(2110)).count(), 0);
    }

    #[test]
    fn test_wide_register_consumes_two_words() {
        let table = RegisterTable::new(vec![
            RegisterDefinition::counter(100, "Energy").wide(),
            RegisterDefinition::counter(102, "Hours"),
        ])
        .unwrap();
        let decoder = RegisterDecoder::new(Arc::new(table));
        let response = framed(&[0x05, 0x04, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x2A]);

        let decoded = values(decoder.decode(&response, Some(100)));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].raw_value, 65_538);
        assert_eq!(decoded[1].register_id, RegisterId::Address(102));
        assert_eq!(decoded[1].raw_value, 42);
    }

    #[test]
    fn test_truncated_wide_register_is_unknown() {
        let table = RegisterTable::new(vec![RegisterDefinition::counter(100, "Energy").wide()]).unwrap();
        let decoder = RegisterDecoder::new(Arc::new(table));
        let response = framed(&[0x05, 0x03, 0x02, 0x00, 0x01]);

        let items: Vec<Decoded> = decoder.decode(&response, Some(100)).collect();
        assert_eq!(items, vec![Decoded::Unknown(RegisterId::Address(100))]);
    }
}
