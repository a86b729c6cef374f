//! Frame codec for the master/slave command protocol.
//!
//! Every request and response is a frame:
//!
//! ```text
//! [module request code: u8][sub-command code: u8][fields ...]
//! ```
//!
//! Fields are fixed width and little-endian:
//!
//! | field  | width | notes                                        |
//! |--------|-------|----------------------------------------------|
//! | u8     | 1     |                                              |
//! | bool   | 1     | 0 or 1                                       |
//! | u16    | 2     |                                              |
//! | u32    | 4     |                                              |
//! | i32    | 4     |                                              |
//! | Q16.16 | 4     | signed, `round_half_even(value * 65536)`     |
//!
//! Most response frames carry a one-byte ACK (`0x00`) / NACK (`0x01`) right after the
//! echoed code pair. The codec does not interpret it; drivers read it as a `u8`.
//!
//! # Example
//!
//! ```
//! use roti_master::protocol::{FrameBuilder, FrameDecoder};
//!
//! let frame = FrameBuilder::new(0x21, 0x05).u8(0).q16(22.0).q16(5.0).bool(true).build();
//! assert_eq!(frame[..3], [0x21, 0x05, 0x00]);
//!
//! let mut reply = FrameDecoder::new(&[0x21, 0x05, 0x00, 0x00], 0x21, 0x05).unwrap();
//! assert_eq!(reply.read_u8().unwrap(), 0x00);
//! ```

mod builder;
mod decoder;

pub use builder::{encode, Field, FrameBuilder};
pub use decoder::FrameDecoder;

/// Positive acknowledgement byte.
pub const ACK: u8 = 0x00;

/// Negative acknowledgement byte.
pub const NACK: u8 = 0x01;

/// Scale factor of the Q16.16 fixed-point format.
pub const Q16_SCALE: f64 = 65536.0;

/// Converts a float to its raw Q16.16 representation.
///
/// Rounds half to even, and saturates values outside the representable range.
pub fn q16_from_f64(value: f64) -> i32 {
    let scaled = (value * Q16_SCALE).round_ties_even();
    if scaled.is_nan() {
        0
    } else if scaled >= i32::MAX as f64 {
        i32::MAX
    } else if scaled <= i32::MIN as f64 {
        i32::MIN
    } else {
        scaled as i32
    }
}

/// Converts a raw Q16.16 value back to a float.
pub fn q16_to_f64(raw: i32) -> f64 {
    raw as f64 / Q16_SCALE
}

/// Rounds to two decimal places, as the slave reports measurements.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
