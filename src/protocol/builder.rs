use bytes::{BufMut, BytesMut};

use super::q16_from_f64;

/// A single typed frame field, for building frames from data rather than code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    /// One byte.
    U8(u8),
    /// One byte, 0 or 1.
    Bool(bool),
    /// Little-endian u16.
    U16(u16),
    /// Little-endian u32.
    U32(u32),
    /// Little-endian i32.
    I32(i32),
    /// Q16.16 fixed point, stored as a little-endian i32.
    Q16(f64),
}

/// Incrementally builds a request frame.
///
/// The module and sub-command codes are written first; fields follow in call order.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    /// Starts a frame addressed to `module` with sub-command `sub`.
    pub fn new(module: u8, sub: u8) -> Self {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(module);
        buf.put_u8(sub);
        Self { buf }
    }

    /// Appends one byte.
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends `value` as 0 or 1.
    pub fn bool(mut self, value: bool) -> Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Appends a little-endian u16.
    pub fn u16(mut self, value: u16) -> Self {
        self.buf.put_u16_le(value);
        self
    }

    /// Appends a little-endian u32.
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32_le(value);
        self
    }

    /// Appends a little-endian i32.
    pub fn i32(mut self, value: i32) -> Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Appends a Q16.16 fixed-point value.
    pub fn q16(mut self, value: f64) -> Self {
        self.buf.put_i32_le(q16_from_f64(value));
        self
    }

    /// Appends `field` with its own encoding.
    pub fn field(self, field: Field) -> Self {
        match field {
            Field::U8(v) => self.u8(v),
            Field::Bool(v) => self.bool(v),
            Field::U16(v) => self.u16(v),
            Field::U32(v) => self.u32(v),
            Field::I32(v) => self.i32(v),
            Field::Q16(v) => self.q16(v),
        }
    }

    /// Frame length so far, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Never true once the header is written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the frame.
    pub fn build(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Encodes a complete frame in one call.
pub fn encode(module: u8, sub: u8, fields: &[Field]) -> Vec<u8> {
    fields
        .iter()
        .fold(FrameBuilder::new(module, sub), |b, f| b.field(*f))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_code_pair_first() {
        let frame = FrameBuilder::new(0x22, 0x03).build();
        assert_eq!(frame, vec![0x22, 0x03]);
    }

    #[test]
    fn little_endian_fields() {
        let frame = FrameBuilder::new(0x20, 0x05)
            .u8(1)
            .u16(0x1234)
            .u32(0xAABB_CCDD)
            .i32(-2)
            .build();
        assert_eq!(
            frame,
            vec![
                0x20, 0x05, 0x01, 0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA, 0xFE, 0xFF, 0xFF, 0xFF
            ]
        );
    }

    #[test]
    fn dispense_by_weight_layout() {
        let frame = FrameBuilder::new(0x21, 0x05)
            .u8(0)
            .q16(22.0)
            .q16(5.0)
            .bool(true)
            .build();
        assert_eq!(
            frame,
            vec![0x21, 0x05, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x05, 0x00, 0x01]
        );
    }

    #[test]
    fn encode_matches_builder() {
        let fields = [Field::Bool(false), Field::Q16(-1.5), Field::U16(500)];
        let built = FrameBuilder::new(0x25, 0x03)
            .bool(false)
            .q16(-1.5)
            .u16(500)
            .build();
        assert_eq!(encode(0x25, 0x03, &fields), built);
    }
}
