//! Datalink and transport-message framing used on the serial line to the slave.
//!
//! Datalink packet:
//!
//! ```text
//! [AA 33 55 CC][type: u8][len: u8][checksum: u16 LE][payload ...]
//! ```
//!
//! - `len` counts the 8-byte header plus the unstuffed payload.
//! - `checksum` is the bitwise NOT of the 16-bit sum of every packet byte, taken with
//!   the checksum field zeroed.
//! - Whenever the start-of-frame pattern appears inside the payload, a `0xFF` stuff
//!   byte is sent right after it so the receiver does not resynchronise on it.
//!
//! The payload is a transport message: `[exchange id: u8][message type: u8][frame ...]`.

use crate::error::{AppResult, MasterError};

/// Start-of-frame marker.
pub const SOF: [u8; 4] = [0xAA, 0x33, 0x55, 0xCC];
/// Byte sent after a start-of-frame pattern that occurs inside the payload.
pub const SOF_STUFF: u8 = 0xFF;
/// SOF, type, length and checksum.
pub const HEADER_LEN: usize = 8;
/// Largest packet the parser buffers.
pub const MAX_PACKET_LEN: usize = 255;

/// Type of a transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Master to slave, expects a response.
    Request = 0,
    /// Slave answer to a request with the same exchange id.
    Response = 1,
    /// Unsolicited message, no answer expected.
    Post = 2,
    /// Slave event notification.
    Notify = 3,
}

impl MessageType {
    /// Maps a wire value to a message type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Post),
            3 => Some(Self::Notify),
            _ => None,
        }
    }
}

/// A decoded transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Pairs a response with its request.
    pub exchange_id: u8,
    /// Message type.
    pub kind: MessageType,
    /// Command frame carried by the message.
    pub body: Vec<u8>,
}

impl Message {
    /// Splits a datalink payload into a transport message.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        Some(Self {
            exchange_id: payload[0],
            kind: MessageType::from_u8(payload[1])?,
            body: payload[2..].to_vec(),
        })
    }
}

fn checksum(bytes: impl IntoIterator<Item = u8>) -> u16 {
    !bytes
        .into_iter()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(b)))
}

/// Wraps a protocol frame in a transport message and a datalink packet.
pub fn encode_packet(exchange_id: u8, kind: MessageType, frame: &[u8]) -> AppResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(frame.len() + 2);
    payload.push(exchange_id);
    payload.push(kind as u8);
    payload.extend_from_slice(frame);

    let total = HEADER_LEN + payload.len();
    if total > MAX_PACKET_LEN {
        return Err(MasterError::Configuration(format!(
            "frame of {} bytes exceeds the {} byte datalink packet limit",
            frame.len(),
            MAX_PACKET_LEN - HEADER_LEN - 2
        )));
    }

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&SOF);
    header[4] = 0;
    header[5] = total as u8;
    let cks = checksum(header.iter().chain(payload.iter()).copied());
    header[6..8].copy_from_slice(&cks.to_le_bytes());

    let mut packet = Vec::with_capacity(total + 4);
    packet.extend_from_slice(&header);
    for (idx, byte) in payload.iter().enumerate() {
        packet.push(*byte);
        if idx >= 3 && payload[idx - 3..=idx] == SOF {
            packet.push(SOF_STUFF);
        }
    }
    Ok(packet)
}

/// Incremental datalink receiver.
///
/// Feed it bytes as they arrive; it yields each checksum-valid payload.
#[derive(Debug, Default)]
pub struct PacketParser {
    buf: Vec<u8>,
    stuff_seen: bool,
}

impl PacketParser {
    /// Empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one received byte; returns a payload once a packet with a valid checksum completes.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if self.buf.len() >= MAX_PACKET_LEN {
            let tail = self.buf.split_off(MAX_PACKET_LEN - 4);
            self.buf = tail;
        }

        let len = self.buf.len();
        if len > 4 && self.buf[len - 4..] == SOF && !self.stuff_seen {
            if byte == SOF_STUFF {
                self.stuff_seen = true;
            } else {
                // resync on a fresh start-of-frame
                self.buf.clear();
                self.buf.extend_from_slice(&SOF);
                self.buf.push(byte);
            }
            return None;
        }

        self.buf.push(byte);
        self.stuff_seen = false;

        // hunt for the start-of-frame until one has been seen
        if self.buf.len() <= 4 {
            if SOF[..self.buf.len()] != self.buf[..] {
                let start = (1..self.buf.len())
                    .find(|&i| SOF[..self.buf.len() - i] == self.buf[i..])
                    .unwrap_or(self.buf.len());
                self.buf.drain(..start);
            }
            return None;
        }

        if self.buf.len() >= HEADER_LEN && self.buf.len() == usize::from(self.buf[5]) {
            let received = u16::from_le_bytes([self.buf[6], self.buf[7]]);
            let computed = checksum(
                self.buf
                    .iter()
                    .enumerate()
                    .map(|(i, b)| if i == 6 || i == 7 { 0 } else { *b }),
            );
            let packet = std::mem::take(&mut self.buf);
            if computed == received {
                return Some(packet[HEADER_LEN..].to_vec());
            }
            log::warn!("datalink packet dropped: invalid checksum");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut PacketParser, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|b| parser.push(*b)).collect()
    }

    #[test]
    fn encodes_header_and_checksum() {
        let packet = encode_packet(7, MessageType::Request, &[0x01, 0x02]).unwrap();
        assert_eq!(&packet[..4], &SOF);
        assert_eq!(packet[4], 0);
        assert_eq!(packet[5], 12);
        let sum: u16 = [0xAAu16, 0x33, 0x55, 0xCC, 0, 12, 7, 0, 1, 2].iter().sum();
        assert_eq!(u16::from_le_bytes([packet[6], packet[7]]), !sum);
        assert_eq!(&packet[8..], &[7, 0, 0x01, 0x02]);
    }

    #[test]
    fn stuffs_sof_inside_payload() {
        let frame = [0x2F, 0x02, 0xAA, 0x33, 0x55, 0xCC, 0x01];
        let packet = encode_packet(1, MessageType::Request, &frame).unwrap();
        assert_eq!(packet[5] as usize, HEADER_LEN + 2 + frame.len());
        assert_eq!(packet.len(), HEADER_LEN + 2 + frame.len() + 1);
        assert_eq!(&packet[12..17], &[0xAA, 0x33, 0x55, 0xCC, 0xFF]);
    }

    #[test]
    fn parser_recovers_payload() {
        let packet = encode_packet(3, MessageType::Response, &[0x21, 0x05, 0x00, 0x00]).unwrap();
        let mut parser = PacketParser::new();
        let got = feed(&mut parser, &packet);
        assert_eq!(got, vec![vec![3, 1, 0x21, 0x05, 0x00, 0x00]]);
    }

    #[test]
    fn parser_removes_stuffing() {
        let frame = [0xAA, 0x33, 0x55, 0xCC, 0x10];
        let packet = encode_packet(9, MessageType::Response, &frame).unwrap();
        let mut parser = PacketParser::new();
        let got = feed(&mut parser, &packet);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0][2..], &frame);
    }

    #[test]
    fn parser_skips_leading_noise() {
        let packet = encode_packet(2, MessageType::Notify, &[0x25, 0x00]).unwrap();
        let mut stream = vec![0x00, 0xAA, 0x13, 0x42];
        stream.extend_from_slice(&packet);
        let mut parser = PacketParser::new();
        assert_eq!(feed(&mut parser, &stream).len(), 1);
    }

    #[test]
    fn parser_drops_bad_checksum() {
        let mut packet = encode_packet(2, MessageType::Response, &[0x25, 0x00, 0x00]).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x55;
        let mut parser = PacketParser::new();
        assert!(feed(&mut parser, &packet).is_empty());
    }

    #[test]
    fn oversized_frame_rejected() {
        let frame = vec![0u8; MAX_PACKET_LEN];
        assert!(encode_packet(0, MessageType::Request, &frame).is_err());
    }

    #[test]
    fn message_parse() {
        let msg = Message::parse(&[5, 1, 0x01, 0x02, 0x00]).unwrap();
        assert_eq!(msg.exchange_id, 5);
        assert_eq!(msg.kind, MessageType::Response);
        assert_eq!(msg.body, vec![0x01, 0x02, 0x00]);
        assert!(Message::parse(&[5, 9]).is_none());
        assert!(Message::parse(&[5]).is_none());
    }
}
