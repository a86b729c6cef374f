//! Kicker (KR) driver.
//!
//! The kicker is a single linear axis that pushes the finished roti out. Moves may be
//! absolute or relative; positions and speeds are Q16.16 millimetres and mm/s.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::command::{request, send_action};
use super::{CommandPoller, Issued, PolledStatus, ReturnCode, StatusSource};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder};
use crate::transport::{SlaveLink, Transport};

/// Request code of the kicker module.
pub const REQ_CODE: u8 = 0x25;

/// Read the kicker status.
pub const SUB_GET_STATE: u8 = 0x00;
/// Clear the error flags.
pub const SUB_CLEAR_ERROR: u8 = 0x01;
/// Home the kicker.
pub const SUB_FIND_DATUM: u8 = 0x02;
/// Absolute or relative move.
pub const SUB_MOVE: u8 = 0x03;

/// Nothing running.
pub const STATE_IDLE: u8 = 0;
/// Move in progress.
pub const STATE_MOVING: u8 = 1;
/// Homing.
pub const STATE_FINDING_DATUM: u8 = 2;
/// Limit search in progress.
pub const STATE_FINDING_LIMIT: u8 = 3;

/// Move failed.
pub const FLAG_MOVE_ERR: u8 = 0x01;
/// Homing failed.
pub const FLAG_DATUM_ERR: u8 = 0x02;
/// Motor fault.
pub const FLAG_MOTOR_ERR: u8 = 0x04;
/// Limit switch fault.
pub const FLAG_LIMIT_ERR: u8 = 0x08;
/// Kicker has been homed.
pub const FLAG_DATUM_KNOWN: u8 = 0x10;

/// Default execution timeout.
pub const EXE_TIMEOUT: Duration = Duration::from_millis(180_000);
/// Default spacing between status checks.
pub const CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Snapshot returned by [`Kicker::status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KickerStatus {
    /// `STATE_*` value.
    pub state: u8,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Position, mm.
    pub pos: f64,
    /// Motor current.
    pub current: f64,
    /// Home sensor reading.
    pub home_state: u8,
}

impl PolledStatus for KickerStatus {
    fn state(&self) -> u8 {
        self.state
    }

    fn has_fault(&self) -> bool {
        self.flags & FLAG_MOVE_ERR != 0
    }
}

/// Kicker driver.
pub struct Kicker<L> {
    transport: Arc<Transport<L>>,
    poller: CommandPoller,
}

impl<L: SlaveLink> Kicker<L> {
    /// Driver with the default timeout and check period.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self {
            transport,
            poller: CommandPoller::new(EXE_TIMEOUT, CHECK_PERIOD),
        }
    }

    /// Replaces the timeout and check period used by [`Kicker::wait`].
    pub fn with_poller(mut self, poller: CommandPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Reads the kicker status.
    pub async fn status(&self) -> AppResult<KickerStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_STATE).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_STATE)?;
        let _ack = dec.read_u8()?;
        Ok(KickerStatus {
            state: dec.read_u8()?,
            flags: dec.read_u8()?,
            pos: dec.read_q16()?,
            current: dec.read_q16()?,
            home_state: dec.read_u8()?,
        })
    }

    /// Clears the error flags.
    pub async fn clear_error_flags(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CLEAR_ERROR).build();
        send_action(&self.transport, &frame).await
    }

    /// Starts a datum search. Must succeed before any move.
    pub async fn find_datum(&self) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_FIND_DATUM).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_FINDING_DATUM))
    }

    /// Starts a move to `pos` (or by `pos`, when `relative`) at `speed`.
    pub async fn move_to(&self, relative: bool, pos: f64, speed: f64) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_MOVE)
            .bool(relative)
            .q16(pos)
            .q16(speed)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        debug!(relative, pos, speed, accepted, "kicker move");
        Ok(Issued::new(accepted, STATE_MOVING))
    }

    /// Waits for the action that put the kicker in `awaiting` to finish.
    pub async fn wait(&self, awaiting: u8) -> AppResult<ReturnCode> {
        let done = self.poller.wait(self, awaiting).await?;
        debug!(code = %done.code, status = ?done.status, "kicker wait");
        Ok(done.code)
    }
}

#[async_trait]
impl<L: SlaveLink> StatusSource for Kicker<L> {
    type Status = KickerStatus;

    async fn query_status(&self) -> AppResult<KickerStatus> {
        self.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::q16_from_f64;
    use crate::transport::MockLink;

    fn status_frame(state: u8, flags: u8, pos: f64) -> Vec<u8> {
        FrameBuilder::new(REQ_CODE, SUB_GET_STATE)
            .u8(0)
            .u8(state)
            .u8(flags)
            .q16(pos)
            .q16(0.8)
            .u8(1)
            .build()
    }

    fn kicker(link: &MockLink) -> Kicker<MockLink> {
        Kicker::new(Arc::new(Transport::new(link.clone())))
    }

    #[tokio::test]
    async fn move_frame_layout() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_MOVE, 0x00]);

        let issued = kicker(&link).move_to(true, 2.5, 10.0).await.unwrap();

        assert!(issued.accepted());
        assert_eq!(issued.awaiting(), STATE_MOVING);
        let mut expected = vec![REQ_CODE, SUB_MOVE, 0x01];
        expected.extend_from_slice(&q16_from_f64(2.5).to_le_bytes());
        expected.extend_from_slice(&q16_from_f64(10.0).to_le_bytes());
        assert_eq!(link.call_log()[0], expected);
    }

    #[tokio::test]
    async fn nack_is_not_accepted() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_FIND_DATUM, 0x01]);
        let issued = kicker(&link).find_datum().await.unwrap();
        assert!(!issued.accepted());
    }

    #[tokio::test]
    async fn decodes_status() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_MOVING, FLAG_DATUM_KNOWN, 12.25));
        let status = kicker(&link).status().await.unwrap();
        assert_eq!(status.state, STATE_MOVING);
        assert_eq!(status.flags, FLAG_DATUM_KNOWN);
        assert_eq!(status.pos, 12.25);
        assert_eq!(status.current, 0.8);
        assert_eq!(status.home_state, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_downgrades_on_move_error() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_MOVING, 0, 1.0));
        link.push_response(status_frame(STATE_IDLE, FLAG_MOVE_ERR, 2.0));
        let code = kicker(&link).wait(STATE_MOVING).await.unwrap();
        assert_eq!(code, ReturnCode::ExecutionError);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ignores_informational_flags() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_IDLE, FLAG_DATUM_KNOWN, 2.0));
        let code = kicker(&link).wait(STATE_MOVING).await.unwrap();
        assert_eq!(code, ReturnCode::NoError);
    }
}
