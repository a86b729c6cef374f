//! Serial datalink to the slave board.
//!
//! Frames are wrapped as transport REQUEST messages inside datalink packets (see
//! [`super::datalink`]) and written to a `tokio-serial` stream. The matching RESPONSE
//! (same exchange id) is the reply; NOTIFY and POST messages arriving in between are
//! logged and skipped.
//!
//! # Example
//!
//! ```no_run
//! use roti_master::transport::{SerialLink, Transport};
//!
//! # fn main() -> roti_master::AppResult<()> {
//! let link = SerialLink::open("/dev/ttyUSB0", 115_200)?;
//! let transport = Transport::new(link);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use log::trace;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::datalink::{encode_packet, Message, MessageType, PacketParser};
use super::SlaveLink;
use crate::error::AppResult;

/// Default line speed of the slave's master port.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// [`SlaveLink`] over a serial port.
pub struct SerialLink {
    /// Serial port protected by Mutex for exclusive access during exchanges
    port: Mutex<SerialStream>,
    port_path: String,
    exchange_id: AtomicU8,
}

impl SerialLink {
    /// Opens `port_path` at `baud_rate`, 8N1, no flow control.
    pub fn open(port_path: &str, baud_rate: u32) -> AppResult<Self> {
        let port = tokio_serial::new(port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        debug!(port = port_path, baud_rate, "serial link opened");
        Ok(Self {
            port: Mutex::new(port),
            port_path: port_path.to_string(),
            // first request goes out with id 0
            exchange_id: AtomicU8::new(255),
        })
    }

    /// Device path the link was opened on.
    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    /// Lists the serial ports present on this machine.
    pub fn available_ports() -> AppResult<Vec<String>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }

    async fn read_response(
        port: &mut SerialStream,
        exchange_id: u8,
        timeout: Duration,
    ) -> AppResult<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut parser = PacketParser::new();
        let mut buf = [0u8; 64];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let n = match tokio::time::timeout(remaining, port.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => return Ok(None),
            };
            if n == 0 {
                return Ok(None);
            }
            trace!("serial rx {:02x?}", &buf[..n]);

            for byte in &buf[..n] {
                let Some(payload) = parser.push(*byte) else {
                    continue;
                };
                match Message::parse(&payload) {
                    Some(msg) if msg.kind == MessageType::Response && msg.exchange_id == exchange_id => {
                        return Ok(Some(msg.body));
                    }
                    Some(msg) => {
                        debug!(kind = ?msg.kind, exchange_id = msg.exchange_id, "skipping unsolicited message");
                    }
                    None => debug!("skipping malformed transport message"),
                }
            }
        }
    }
}

#[async_trait]
impl SlaveLink for SerialLink {
    async fn exchange(&self, frame: &[u8], timeout: Duration) -> AppResult<Option<Vec<u8>>> {
        let exchange_id = self.exchange_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let packet = encode_packet(exchange_id, MessageType::Request, frame)?;

        let mut port = self.port.lock().await;
        trace!("serial tx {:02x?}", packet);
        port.write_all(&packet).await?;
        port.flush().await?;

        Self::read_response(&mut port, exchange_id, timeout).await
    }
}
