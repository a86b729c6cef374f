use bytes::Buf;

use super::{q16_to_f64, round2};
use crate::error::{AppResult, MasterError};

/// Sequential reader over a response frame.
///
/// Construction validates the echoed code pair; every read advances a cursor and
/// fails with [`MasterError::TruncatedFrame`] instead of reading past the end.
#[derive(Debug)]
pub struct FrameDecoder<'a> {
    buf: &'a [u8],
}

impl<'a> FrameDecoder<'a> {
    /// Validates that `frame` answers `(module, sub)` and positions the cursor on the
    /// first field after the code pair.
    pub fn new(frame: &'a [u8], module: u8, sub: u8) -> AppResult<Self> {
        if frame.len() < 2 {
            return Err(MasterError::TruncatedFrame {
                needed: 2,
                remaining: frame.len(),
            });
        }
        if frame[0] != module || frame[1] != sub {
            return Err(MasterError::ProtocolMismatch {
                expected: (module, sub),
                found: (frame[0], frame[1]),
            });
        }
        Ok(Self { buf: &frame[2..] })
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, needed: usize) -> AppResult<()> {
        if self.buf.remaining() < needed {
            return Err(MasterError::TruncatedFrame {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> AppResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    /// Any non-zero byte reads as `true`.
    pub fn read_bool(&mut self) -> AppResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a little-endian u16.
    pub fn read_u16(&mut self) -> AppResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&mut self) -> AppResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Reads a little-endian i32.
    pub fn read_i32(&mut self) -> AppResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    /// Reads a Q16.16 value rounded to two decimals.
    pub fn read_q16(&mut self) -> AppResult<f64> {
        Ok(round2(self.read_q16_raw()?))
    }

    /// Reads a Q16.16 value at full precision.
    pub fn read_q16_raw(&mut self) -> AppResult<f64> {
        Ok(q16_to_f64(self.read_i32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuilder;

    #[test]
    fn boundary_round_trip() {
        let frame = FrameBuilder::new(0x2F, 0x00)
            .u8(0)
            .u8(255)
            .bool(true)
            .u16(0)
            .u16(65535)
            .u32(u32::MAX)
            .q16(32767.99998)
            .q16(-32767.99998)
            .q16(0.0)
            .build();

        let mut dec = FrameDecoder::new(&frame, 0x2F, 0x00).unwrap();
        assert_eq!(dec.read_u8().unwrap(), 0);
        assert_eq!(dec.read_u8().unwrap(), 255);
        assert!(dec.read_bool().unwrap());
        assert_eq!(dec.read_u16().unwrap(), 0);
        assert_eq!(dec.read_u16().unwrap(), 65535);
        assert_eq!(dec.read_u32().unwrap(), u32::MAX);
        assert!((dec.read_q16().unwrap() - 32767.99998).abs() <= 0.01);
        assert!((dec.read_q16().unwrap() + 32767.99998).abs() <= 0.01);
        assert_eq!(dec.read_q16().unwrap(), 0.0);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn raw_q16_keeps_precision() {
        let frame = FrameBuilder::new(0x20, 0x00).q16(1.0 / 1024.0).build();
        let mut dec = FrameDecoder::new(&frame, 0x20, 0x00).unwrap();
        assert_eq!(dec.read_q16_raw().unwrap(), 1.0 / 1024.0);
    }

    #[test]
    fn mismatched_module_code() {
        let err = FrameDecoder::new(&[0x22, 0x05, 0x00], 0x21, 0x05).unwrap_err();
        assert!(matches!(
            err,
            MasterError::ProtocolMismatch {
                expected: (0x21, 0x05),
                found: (0x22, 0x05)
            }
        ));
    }

    #[test]
    fn mismatched_sub_code() {
        let err = FrameDecoder::new(&[0x21, 0x04, 0x00], 0x21, 0x05).unwrap_err();
        assert!(matches!(err, MasterError::ProtocolMismatch { .. }));
    }

    #[test]
    fn short_frame_is_truncated() {
        let err = FrameDecoder::new(&[0x21], 0x21, 0x05).unwrap_err();
        assert!(matches!(
            err,
            MasterError::TruncatedFrame {
                needed: 2,
                remaining: 1
            }
        ));
    }

    #[test]
    fn reading_past_end_is_truncated() {
        let mut dec = FrameDecoder::new(&[0x24, 0x00, 0x00, 0x01, 0x02], 0x24, 0x00).unwrap();
        assert_eq!(dec.read_u8().unwrap(), 0x00);
        let err = dec.read_q16().unwrap_err();
        assert!(matches!(
            err,
            MasterError::TruncatedFrame {
                needed: 4,
                remaining: 2
            }
        ));
    }
}
