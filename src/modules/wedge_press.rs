//! Wedge-press (WP) driver.
//!
//! Two coupled axes: the press plate and the pivot (wedge). Positions are gaps in
//! millimetres; timed moves take a desired duration in milliseconds.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::command::{request, send_action};
use super::{CommandPoller, Issued, PolledStatus, ReturnCode, StatusSource};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder, ACK};
use crate::transport::{SlaveLink, Transport};

/// Request code of the wedge-press module.
pub const REQ_CODE: u8 = 0x23;

/// Read the press status.
pub const SUB_GET_STATE: u8 = 0x00;
/// Clear the error flags.
pub const SUB_CLEAR_ERROR: u8 = 0x01;
/// Home the selected axes.
pub const SUB_FIND_DATUM: u8 = 0x02;
/// Move both axes to absolute gaps.
pub const SUB_MOVE: u8 = 0x03;
/// Move both axes to angles.
pub const SUB_ANGLE_MOVE: u8 = 0x04;
/// Calibrate the position flags.
pub const SUB_CALIBRATE: u8 = 0x05;
/// Read the calibrated dimensions.
pub const SUB_GET_DIMENSION: u8 = 0x06;
/// Persist the calibrated dimensions.
pub const SUB_SAVE_DIMENSION: u8 = 0x07;
/// Move the press axis alone.
pub const SUB_MOVE_PRESS: u8 = 0x08;
/// Move the pivot (wedge) axis alone.
pub const SUB_MOVE_PIVOT: u8 = 0x09;

/// Nothing running.
pub const STATE_IDLE: u8 = 0;
/// Move in progress.
pub const STATE_MOVING: u8 = 1;
/// Homing.
pub const STATE_FINDING_DATUM: u8 = 2;
/// Flag calibration in progress.
pub const STATE_CALIBRATING: u8 = 3;

/// Move failed.
pub const FLAG_MOVE_ERR: u8 = 0x01;
/// Homing failed.
pub const FLAG_DATUM_ERR: u8 = 0x02;
/// Press axis driver link is up.
pub const FLAG_PRESS_LINK: u8 = 0x04;
/// Pivot axis driver link is up.
pub const FLAG_PIVOT_LINK: u8 = 0x08;
/// Press axis has been homed.
pub const FLAG_PRESS_DATUM_KNOWN: u8 = 0x10;
/// Pivot axis has been homed.
pub const FLAG_PIVOT_DATUM_KNOWN: u8 = 0x20;

/// Number of Q16 dimension values in a GET_DIMENSION reply.
pub const DIMENSION_COUNT: usize = 15;

/// Default execution timeout.
pub const EXE_TIMEOUT: Duration = Duration::from_millis(60_000);
/// Default spacing between status checks.
pub const CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Snapshot returned by [`WedgePress::status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WedgePressStatus {
    /// `STATE_*` value.
    pub state: u8,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Press axis gap, mm.
    pub press_gap: f64,
    /// Pivot axis gap, mm.
    pub pivot_gap: f64,
    /// Press motor current.
    pub press_current: f64,
    /// Pivot motor current.
    pub pivot_current: f64,
}

impl PolledStatus for WedgePressStatus {
    fn state(&self) -> u8 {
        self.state
    }

    fn has_fault(&self) -> bool {
        self.flags & FLAG_MOVE_ERR != 0
    }
}

/// Calibrated flag dimensions reported by GET_DIMENSION.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagDimensions {
    /// True when the slave answered with ACK.
    pub accepted: bool,
    /// Flag the dimensions belong to.
    pub flag: u8,
    /// [`DIMENSION_COUNT`] values.
    pub values: Vec<f64>,
}

/// Wedge-press driver.
pub struct WedgePress<L> {
    transport: Arc<Transport<L>>,
    poller: CommandPoller,
}

impl<L: SlaveLink> WedgePress<L> {
    /// Driver with the default timeout and check period.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self {
            transport,
            poller: CommandPoller::new(EXE_TIMEOUT, CHECK_PERIOD),
        }
    }

    /// Replaces the timeout and check period used by [`WedgePress::wait`].
    pub fn with_poller(mut self, poller: CommandPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Reads the press status.
    pub async fn status(&self) -> AppResult<WedgePressStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_STATE).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_STATE)?;
        let _ack = dec.read_u8()?;
        Ok(WedgePressStatus {
            state: dec.read_u8()?,
            flags: dec.read_u8()?,
            press_gap: dec.read_q16()?,
            pivot_gap: dec.read_q16()?,
            press_current: dec.read_q16()?,
            pivot_current: dec.read_q16()?,
        })
    }

    /// Clears the error flags.
    pub async fn clear_error_flags(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CLEAR_ERROR).build();
        send_action(&self.transport, &frame).await
    }

    /// Starts a datum search on the axes selected by `flag`.
    pub async fn find_datum(&self, flag: u8) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_FIND_DATUM).u8(flag).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_FINDING_DATUM))
    }

    /// Starts flag calibration.
    pub async fn calibrate_flag(&self) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CALIBRATE).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_CALIBRATING))
    }

    /// Reads the calibrated dimensions of `flag`.
    pub async fn flag_dimensions(&self, flag: u8) -> AppResult<FlagDimensions> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_DIMENSION).u8(flag).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_DIMENSION)?;
        let accepted = dec.read_u8()? == ACK;
        let flag = dec.read_u8()?;
        let values = (0..DIMENSION_COUNT)
            .map(|_| dec.read_q16())
            .collect::<AppResult<Vec<_>>>()?;
        Ok(FlagDimensions {
            accepted,
            flag,
            values,
        })
    }

    /// Persists the calibrated dimensions on the slave.
    pub async fn save_dimensions(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SAVE_DIMENSION).build();
        send_action(&self.transport, &frame).await
    }

    /// Moves both axes to absolute gaps over `time_ms`.
    pub async fn move_absolute(&self, press: f64, pivot: f64, time_ms: u16) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_MOVE)
            .q16(press)
            .q16(pivot)
            .u16(time_ms)
            .build();
        self.start_move(&frame).await
    }

    /// Moves the press axis to `press` over `time_ms`.
    pub async fn move_press(&self, press: f64, time_ms: u16) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_MOVE_PRESS)
            .q16(press)
            .u16(time_ms)
            .build();
        self.start_move(&frame).await
    }

    /// Moves the pivot axis to `pivot` over `time_ms`.
    pub async fn move_wedge(&self, pivot: f64, time_ms: u16) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_MOVE_PIVOT)
            .q16(pivot)
            .u16(time_ms)
            .build();
        self.start_move(&frame).await
    }

    /// Moves the axes selected by `flag` to the given angles at `speed`.
    pub async fn move_angular(
        &self,
        flag: u8,
        press_angle: f64,
        pivot_angle: f64,
        speed: f64,
    ) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_ANGLE_MOVE)
            .u8(flag)
            .q16(press_angle)
            .q16(pivot_angle)
            .q16(speed)
            .build();
        self.start_move(&frame).await
    }

    async fn start_move(&self, frame: &[u8]) -> AppResult<Issued> {
        let accepted = send_action(&self.transport, frame).await?;
        debug!(sub = frame[1], accepted, "wedge press move");
        Ok(Issued::new(accepted, STATE_MOVING))
    }

    /// Waits for the action that put the press in `awaiting` to finish.
    pub async fn wait(&self, awaiting: u8) -> AppResult<ReturnCode> {
        let done = self.poller.wait(self, awaiting).await?;
        debug!(code = %done.code, status = ?done.status, "wedge press wait");
        Ok(done.code)
    }
}

#[async_trait]
impl<L: SlaveLink> StatusSource for WedgePress<L> {
    type Status = WedgePressStatus;

    async fn query_status(&self) -> AppResult<WedgePressStatus> {
        self.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;

    fn press(link: &MockLink) -> WedgePress<MockLink> {
        WedgePress::new(Arc::new(Transport::new(link.clone())))
    }

    fn status_frame(state: u8, flags: u8) -> Vec<u8> {
        FrameBuilder::new(REQ_CODE, SUB_GET_STATE)
            .u8(0)
            .u8(state)
            .u8(flags)
            .q16(3.5)
            .q16(7.25)
            .q16(0.1)
            .q16(0.2)
            .build()
    }

    #[tokio::test]
    async fn move_press_layout() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_MOVE_PRESS, 0x00]);
        press(&link).move_press(1.0, 800).await.unwrap();
        assert_eq!(
            link.call_log()[0],
            vec![REQ_CODE, SUB_MOVE_PRESS, 0x00, 0x00, 0x01, 0x00, 0x20, 0x03]
        );
    }

    #[tokio::test]
    async fn decodes_dimensions() {
        let link = MockLink::new();
        let mut reply = FrameBuilder::new(REQ_CODE, SUB_GET_DIMENSION).u8(0).u8(2);
        for i in 0..DIMENSION_COUNT {
            reply = reply.q16(i as f64 * 0.5);
        }
        link.push_response(reply.build());

        let dims = press(&link).flag_dimensions(2).await.unwrap();
        assert!(dims.accepted);
        assert_eq!(dims.flag, 2);
        assert_eq!(dims.values.len(), DIMENSION_COUNT);
        assert_eq!(dims.values[14], 7.0);
    }

    #[tokio::test]
    async fn short_dimension_reply_is_truncated() {
        let link = MockLink::new();
        link.push_response(FrameBuilder::new(REQ_CODE, SUB_GET_DIMENSION).u8(0).u8(2).q16(1.0).build());
        let err = press(&link).flag_dimensions(2).await.unwrap_err();
        assert!(matches!(err, crate::MasterError::TruncatedFrame { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_flags_move_error() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_IDLE, FLAG_MOVE_ERR | FLAG_PRESS_DATUM_KNOWN));
        let code = press(&link).wait(STATE_MOVING).await.unwrap();
        assert_eq!(code, ReturnCode::ExecutionError);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_success() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_MOVING, 0));
        link.push_response(status_frame(STATE_MOVING, 0));
        link.push_response(status_frame(STATE_IDLE, FLAG_PIVOT_DATUM_KNOWN));
        let code = press(&link).wait(STATE_MOVING).await.unwrap();
        assert_eq!(code, ReturnCode::NoError);
        assert_eq!(link.calls_with(REQ_CODE, SUB_GET_STATE), 3);
    }
}
