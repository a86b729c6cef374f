//! Dispenser (DS) driver.
//!
//! One request code drives three dispensers (flour, water, oil) selected by an id
//! byte. Most replies echo that id back; a reply for a different id is a protocol
//! fault and surfaces as [`MasterError::EchoMismatch`](crate::MasterError).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::command::{check_echo, request, send_action, send_action_echo};
use super::{CommandPoller, Issued, PolledStatus, ReturnCode, StatusSource};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder};
use crate::transport::{SlaveLink, Transport};

/// Request code of the dispenser module.
pub const REQ_CODE: u8 = 0x21;

/// Read one dispenser's status.
pub const SUB_GET_STATUS: u8 = 0x00;
/// Clear one dispenser's error flags.
pub const SUB_CLEAR_ERROR: u8 = 0x01;
/// Zero the load cell.
pub const SUB_TARE: u8 = 0x02;
/// Write a tuning parameter.
pub const SUB_SET_PARAM: u8 = 0x03;
/// Dispense for a fixed time.
pub const SUB_BY_TIME: u8 = 0x04;
/// Dispense up to a target weight.
pub const SUB_BY_WEIGHT: u8 = 0x05;
/// Stop a running dispense.
pub const SUB_ABORT: u8 = 0x06;

/// Flour dispenser.
pub const ID_FLOUR: u8 = 0;
/// Water dispenser.
pub const ID_WATER: u8 = 1;
/// Oil dispenser.
pub const ID_OIL: u8 = 2;

/// Nothing running.
pub const STATE_IDLE: u8 = 0;
/// Dispense in progress.
pub const STATE_DISPENSING: u8 = 1;
/// Load cell zeroing in progress.
pub const STATE_TARING: u8 = 2;

/// Motor fault.
pub const FLAG_MOTOR_ERR: u8 = 0x01;
/// Auger or shutter position lost.
pub const FLAG_POSITION_ERR: u8 = 0x02;
/// Firmware-side dispense timeout.
pub const FLAG_TIMEOUT_ERR: u8 = 0x04;
/// Load cell fault.
pub const FLAG_LOADCELL_ERR: u8 = 0x08;
/// Shutter fault.
pub const FLAG_SHUTTER_ERR: u8 = 0x10;

/// Every fault bit.
pub const FLAG_ALL_ERRS: u8 =
    FLAG_MOTOR_ERR | FLAG_POSITION_ERR | FLAG_TIMEOUT_ERR | FLAG_LOADCELL_ERR | FLAG_SHUTTER_ERR;

/// Default execution timeout of a dispense.
pub const EXE_TIMEOUT: Duration = Duration::from_millis(180_000);
/// Default spacing between status checks.
pub const CHECK_PERIOD: Duration = Duration::from_millis(100);

const ECHO_FIELD: &str = "dispenser id";

/// Snapshot returned by [`Dispenser::status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispenserStatus {
    /// Dispenser the snapshot belongs to.
    pub id: u8,
    /// `STATE_*` value.
    pub state: u8,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Weight dispensed so far, grams.
    pub weight: f64,
}

impl PolledStatus for DispenserStatus {
    fn state(&self) -> u8 {
        self.state
    }

    fn has_fault(&self) -> bool {
        self.flags & FLAG_ALL_ERRS != 0
    }
}

/// Dispenser driver.
pub struct Dispenser<L> {
    transport: Arc<Transport<L>>,
    poller: CommandPoller,
}

impl<L: SlaveLink> Dispenser<L> {
    /// Driver with the default timeout and check period.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self {
            transport,
            poller: CommandPoller::new(EXE_TIMEOUT, CHECK_PERIOD),
        }
    }

    /// Replaces the timeout and check period used by [`Dispenser::wait`].
    pub fn with_poller(mut self, poller: CommandPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Reads the status of dispenser `id`.
    pub async fn status(&self, id: u8) -> AppResult<DispenserStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_STATUS).u8(id).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_STATUS)?;
        let _ack = dec.read_u8()?;
        let echoed = dec.read_u8()?;
        check_echo(REQ_CODE, ECHO_FIELD, id, echoed)?;
        Ok(DispenserStatus {
            id: echoed,
            state: dec.read_u8()?,
            flags: dec.read_u8()?,
            weight: dec.read_q16()?,
        })
    }

    /// Clears the error flags of dispenser `id`.
    pub async fn clear_error_flags(&self, id: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CLEAR_ERROR).u8(id).build();
        send_action_echo(&self.transport, &frame, ECHO_FIELD, id).await
    }

    /// Zeroes the load cell.
    pub async fn tare(&self) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_TARE).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_TARING))
    }

    /// Writes tuning parameter `param` of dispenser `id`.
    pub async fn set_param(&self, id: u8, param: u8, value: f64) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_PARAM)
            .u8(id)
            .u8(param)
            .q16(value)
            .build();
        send_action_echo(&self.transport, &frame, ECHO_FIELD, id).await
    }

    /// Runs dispenser `id` for `time_ms` at `speed`.
    pub async fn dispense_by_time(&self, id: u8, time_ms: u32, speed: f64) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_BY_TIME)
            .u8(id)
            .u32(time_ms)
            .q16(speed)
            .build();
        let accepted = send_action_echo(&self.transport, &frame, ECHO_FIELD, id).await?;
        info!(id, time_ms, speed, accepted, "dispense by time");
        Ok(Issued::new(accepted, STATE_DISPENSING))
    }

    /// Dispenses `weight` grams from dispenser `id` at `speed`.
    pub async fn dispense_by_weight(
        &self,
        id: u8,
        weight: f64,
        speed: f64,
        close_shutter: bool,
    ) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_BY_WEIGHT)
            .u8(id)
            .q16(weight)
            .q16(speed)
            .bool(close_shutter)
            .build();
        let accepted = send_action_echo(&self.transport, &frame, ECHO_FIELD, id).await?;
        info!(id, weight, speed, accepted, "dispense by weight");
        Ok(Issued::new(accepted, STATE_DISPENSING))
    }

    /// Stops a running dispense on dispenser `id`.
    pub async fn abort(&self, id: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_ABORT).u8(id).build();
        send_action_echo(&self.transport, &frame, ECHO_FIELD, id).await
    }

    /// Waits for dispenser `id` to leave `awaiting`.
    pub async fn wait(&self, id: u8, awaiting: u8) -> AppResult<ReturnCode> {
        let source = ById {
            dispenser: self,
            id,
        };
        let done = self.poller.wait(&source, awaiting).await?;
        debug!(id, code = %done.code, status = ?done.status, "dispenser wait");
        Ok(done.code)
    }
}

/// Status source bound to one dispenser id.
struct ById<'a, L> {
    dispenser: &'a Dispenser<L>,
    id: u8,
}

#[async_trait]
impl<'a, L: SlaveLink> StatusSource for ById<'a, L> {
    type Status = DispenserStatus;

    async fn query_status(&self) -> AppResult<DispenserStatus> {
        self.dispenser.status(self.id).await
    }
}
