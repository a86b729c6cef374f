//! Vertical-tray (VT) driver.
//!
//! The tray lifts the kneading pot between the dispenser and the kneader. Its top
//! limit is found at start-up and every "move to top" position in a recipe is an
//! offset below that limit.

use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::command::{request, send_action};
use super::{CommandPoller, Issued, PolledStatus, ReturnCode, StatusSource};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder, ACK};
use crate::transport::{SlaveLink, Transport};

/// Request code of the vertical-tray module.
pub const REQ_CODE: u8 = 0x22;

/// Read the tray status.
pub const SUB_GET_STATE: u8 = 0x00;
/// Clear the error flags.
pub const SUB_CLEAR_ERROR: u8 = 0x01;
/// Home the tray.
pub const SUB_FIND_DATUM: u8 = 0x02;
/// Move, optionally with overload protection.
pub const SUB_MOVE: u8 = 0x03;
/// Jog upwards until the overload threshold trips.
pub const SUB_FIND_TOP_LIMIT: u8 = 0x04;
/// Read the last top limit found.
pub const SUB_GET_TOP_LIMIT: u8 = 0x05;
/// Calibrate the position flags.
pub const SUB_CALIBRATE: u8 = 0x06;
/// Read the calibrated flag dimensions.
pub const SUB_GET_FLAG_DIMENSION: u8 = 0x07;
/// Persist calibration to non-volatile storage.
pub const SUB_STORE_NVS: u8 = 0x08;

/// Nothing running.
pub const STATE_IDLE: u8 = 0;
/// Move in progress.
pub const STATE_MOVING: u8 = 1;
/// Homing.
pub const STATE_FINDING_DATUM: u8 = 2;
/// Top-limit search in progress.
pub const STATE_FINDING_TOP: u8 = 3;
/// Flag calibration in progress.
pub const STATE_CALIBRATING: u8 = 4;

/// Move failed.
pub const FLAG_MOVE_ERR: u8 = 0x01;
/// Homing failed.
pub const FLAG_DATUM_ERR: u8 = 0x02;
/// Motor fault.
pub const FLAG_MOTOR_ERR: u8 = 0x04;
/// Motor current exceeded the move's overload limit.
pub const FLAG_OVERLOAD: u8 = 0x08;
/// Tray has been homed.
pub const FLAG_DATUM_KNOWN: u8 = 0x10;
/// Top limit has been found.
pub const FLAG_LIMIT_KNOWN: u8 = 0x20;

/// Every fault bit.
pub const FLAG_ALL_ERRS: u8 = FLAG_MOVE_ERR | FLAG_DATUM_ERR | FLAG_MOTOR_ERR | FLAG_OVERLOAD;

/// Default execution timeout.
pub const EXE_TIMEOUT: Duration = Duration::from_millis(60_000);
/// Default spacing between status checks.
pub const CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Top-limit positions accepted as mechanically plausible.
pub const TOP_LIMIT_RANGE: RangeInclusive<f64> = 46.0..=50.0;

/// Jog distance used for the top-limit search.
pub const TOP_LIMIT_JOG: f64 = 0.5;
/// Motor current that marks the top limit during the search.
pub const TOP_LIMIT_OVERLOAD: f64 = 1.2;

/// Number of Q16 values in a GET_FLAG_DIMENSION reply.
pub const FLAG_DIMENSION_COUNT: usize = 8;

/// Snapshot returned by [`VerticalTray::status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerticalTrayStatus {
    /// `STATE_*` value.
    pub state: u8,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Tray position, mm.
    pub pos: f64,
    /// Motor current.
    pub current: f64,
}

impl PolledStatus for VerticalTrayStatus {
    fn state(&self) -> u8 {
        self.state
    }

    fn has_fault(&self) -> bool {
        self.flags & FLAG_ALL_ERRS != 0
    }
}

/// Vertical-tray driver.
pub struct VerticalTray<L> {
    transport: Arc<Transport<L>>,
    poller: CommandPoller,
}

impl<L: SlaveLink> VerticalTray<L> {
    /// Driver with the default timeout and check period.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self {
            transport,
            poller: CommandPoller::new(EXE_TIMEOUT, CHECK_PERIOD),
        }
    }

    /// Replaces the timeout and check period used by [`VerticalTray::wait`].
    pub fn with_poller(mut self, poller: CommandPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Reads the tray status.
    pub async fn status(&self) -> AppResult<VerticalTrayStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_STATE).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_STATE)?;
        let _ack = dec.read_u8()?;
        Ok(VerticalTrayStatus {
            state: dec.read_u8()?,
            flags: dec.read_u8()?,
            pos: dec.read_q16()?,
            current: dec.read_q16()?,
        })
    }

    /// Clears the error flags.
    pub async fn clear_error_flags(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CLEAR_ERROR).build();
        send_action(&self.transport, &frame).await
    }

    /// Starts homing.
    pub async fn find_datum(&self) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_FIND_DATUM).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_FINDING_DATUM))
    }

    /// Starts a move without overload protection.
    pub async fn move_to(&self, relative: bool, pos: f64, speed: f64) -> AppResult<Issued> {
        self.move_with_overload(relative, pos, speed, 0.0).await
    }

    /// Starts a move that aborts once the motor current exceeds `overload`.
    pub async fn move_with_overload(
        &self,
        relative: bool,
        pos: f64,
        speed: f64,
        overload: f64,
    ) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_MOVE)
            .bool(relative)
            .q16(pos)
            .q16(speed)
            .q16(overload)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        debug!(relative, pos, speed, accepted, "vertical tray move");
        Ok(Issued::new(accepted, STATE_MOVING))
    }

    /// Starts jogging up by `jog` until the current exceeds `overload_threshold`.
    pub async fn find_top_limit(&self, jog: f64, overload_threshold: f64) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_FIND_TOP_LIMIT)
            .q16(jog)
            .q16(overload_threshold)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_FINDING_TOP))
    }

    /// Reads the last top limit found, or `None` if the slave refused.
    pub async fn top_limit(&self) -> AppResult<Option<f64>> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_TOP_LIMIT).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_TOP_LIMIT)?;
        if dec.read_u8()? != ACK {
            return Ok(None);
        }
        Ok(Some(dec.read_q16()?))
    }

    /// Starts flag calibration.
    pub async fn calibrate(&self) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CALIBRATE).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_CALIBRATING))
    }

    /// Reads the calibrated flag dimensions.
    pub async fn flag_dimensions(&self) -> AppResult<Vec<f64>> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_FLAG_DIMENSION).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_FLAG_DIMENSION)?;
        let _ack = dec.read_u8()?;
        (0..FLAG_DIMENSION_COUNT).map(|_| dec.read_q16()).collect()
    }

    /// Persists calibration on the slave.
    pub async fn store_nvs(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_STORE_NVS).build();
        send_action(&self.transport, &frame).await
    }

    /// Waits for the action that put the tray in `awaiting` to finish.
    pub async fn wait(&self, awaiting: u8) -> AppResult<ReturnCode> {
        let done = self.poller.wait(self, awaiting).await?;
        debug!(code = %done.code, status = ?done.status, "vertical tray wait");
        Ok(done.code)
    }

    /// Homes the tray and measures its top limit, trying twice.
    ///
    /// Returns the limit only when it falls inside [`TOP_LIMIT_RANGE`].
    pub async fn find_datum_and_limit(&self) -> AppResult<(ReturnCode, Option<f64>)> {
        let mut code = ReturnCode::GeneralError;
        for attempt in 1..=2 {
            code = self.run_to_completion(self.find_datum().await?).await?;
            if !code.is_ok() {
                warn!(attempt, code = %code, "vertical tray datum search failed");
                self.clear_error_flags().await?;
                continue;
            }

            let search = self.find_top_limit(TOP_LIMIT_JOG, TOP_LIMIT_OVERLOAD).await?;
            code = self.run_to_completion(search).await?;
            if !code.is_ok() {
                warn!(attempt, code = %code, "vertical tray top-limit search failed");
                self.clear_error_flags().await?;
                continue;
            }

            match self.top_limit().await? {
                Some(limit) if TOP_LIMIT_RANGE.contains(&limit) => {
                    info!(limit, "vertical tray top limit found");
                    return Ok((ReturnCode::NoError, Some(limit)));
                }
                other => {
                    warn!(attempt, limit = ?other, "vertical tray top limit out of range");
                    code = ReturnCode::ExecutionError;
                }
            }
        }
        Ok((code, None))
    }

    async fn run_to_completion(&self, issued: Issued) -> AppResult<ReturnCode> {
        if !issued.accepted() {
            return Ok(ReturnCode::SendError);
        }
        self.wait(issued.awaiting()).await
    }
}

#[async_trait]
impl<L: SlaveLink> StatusSource for VerticalTray<L> {
    type Status = VerticalTrayStatus;

    async fn query_status(&self) -> AppResult<VerticalTrayStatus> {
        self.status().await
    }
}
