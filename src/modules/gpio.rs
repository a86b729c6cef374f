//! Board-level digital inputs and outputs (module 0x2F).

use std::sync::Arc;

use super::command::{request, send_action};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder, ACK};
use crate::transport::{SlaveLink, Transport};

/// Request code of the GPIO module.
pub const REQ_CODE: u8 = 0x2F;

/// Read back a digital output.
pub const SUB_DOUT_GET: u8 = 0x00;
/// Read a digital input.
pub const SUB_DIN_GET: u8 = 0x01;
/// Drive a digital output.
pub const SUB_DOUT_SET: u8 = 0x02;

/// GPIO driver.
pub struct Gpio<L> {
    transport: Arc<Transport<L>>,
}

impl<L: SlaveLink> Gpio<L> {
    /// Driver over `transport`.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self { transport }
    }

    /// Reads back digital output `id`. `None` if the slave refused.
    pub async fn dout_get(&self, id: u8) -> AppResult<Option<u8>> {
        self.read(SUB_DOUT_GET, id).await
    }

    /// Reads digital input `id`. `None` if the slave refused.
    pub async fn din_get(&self, id: u8) -> AppResult<Option<u8>> {
        self.read(SUB_DIN_GET, id).await
    }

    /// Drives digital output `id` to `value`.
    pub async fn dout_set(&self, id: u8, value: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_DOUT_SET)
            .u8(id)
            .u8(value)
            .build();
        send_action(&self.transport, &frame).await
    }

    async fn read(&self, sub: u8, id: u8) -> AppResult<Option<u8>> {
        let frame = FrameBuilder::new(REQ_CODE, sub).u8(id).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, sub)?;
        if dec.read_u8()? != ACK {
            return Ok(None);
        }
        Ok(Some(dec.read_u8()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;

    #[tokio::test]
    async fn reads_input() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_DIN_GET, 0x00, 0x01]);
        let gpio = Gpio::new(Arc::new(Transport::new(link.clone())));

        assert_eq!(gpio.din_get(3).await.unwrap(), Some(1));
        assert_eq!(link.call_log()[0], vec![REQ_CODE, SUB_DIN_GET, 3]);
    }

    #[tokio::test]
    async fn refused_read_is_none() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_DOUT_GET, 0x01]);
        let gpio = Gpio::new(Arc::new(Transport::new(link.clone())));
        assert_eq!(gpio.dout_get(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sets_output() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_DOUT_SET, 0x00]);
        let gpio = Gpio::new(Arc::new(Transport::new(link.clone())));

        assert!(gpio.dout_set(2, 1).await.unwrap());
        assert_eq!(link.call_log()[0], vec![REQ_CODE, SUB_DOUT_SET, 2, 1]);
    }
}
