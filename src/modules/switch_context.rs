//! Bootloader/application context switch (module 0x02).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::command::send_action;
use crate::error::AppResult;
use crate::protocol::FrameBuilder;
use crate::transport::{SlaveLink, Transport};

/// Request code of the context-switch module.
pub const REQ_CODE: u8 = 0x02;
/// Switch to another firmware context.
pub const SUB_SWITCH: u8 = 0x01;

/// Firmware image the slave runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Context {
    /// Firmware update loader.
    Bootloader = 1,
    /// Normal machine firmware.
    Application = 2,
}

/// Context-switch driver.
pub struct SwitchContext<L> {
    transport: Arc<Transport<L>>,
}

impl<L: SlaveLink> SwitchContext<L> {
    /// Driver over `transport`.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self { transport }
    }

    /// Asks the slave to restart into `context`. True when it accepted.
    pub async fn switch_to(&self, context: Context) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SWITCH)
            .u8(context as u8)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        info!(?context, accepted, "switch context");
        Ok(accepted)
    }
}
