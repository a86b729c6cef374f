//! Firmware identification (module 0x01).

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::command::request;
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder, ACK};
use crate::transport::{SlaveLink, Transport};

/// Request code of the identification module.
pub const REQ_CODE: u8 = 0x01;
/// Read the firmware version.
pub const SUB_GET_VERSION: u8 = 0x02;

/// Slave firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch level.
    pub patch: u8,
    /// Built from a working tree with uncommitted changes.
    pub dirty: bool,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.dirty {
            f.write_str("-dirty")?;
        }
        Ok(())
    }
}

/// Identification driver.
pub struct WhoAmI<L> {
    transport: Arc<Transport<L>>,
}

impl<L: SlaveLink> WhoAmI<L> {
    /// Driver over `transport`.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self { transport }
    }

    /// Reads the slave firmware version. `None` if the slave refused.
    pub async fn version(&self) -> AppResult<Option<FirmwareVersion>> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_VERSION).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_VERSION)?;
        if dec.read_u8()? != ACK {
            return Ok(None);
        }
        Ok(Some(FirmwareVersion {
            major: dec.read_u8()?,
            minor: dec.read_u8()?,
            patch: dec.read_u8()?,
            dirty: dec.read_bool()?,
        }))
    }
}
