//! Kneader (KN) driver: stirrer motor, positioning motor and the ejector.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::command::{request, send_action, send_action_echo};
use super::{CommandPoller, Issued, PolledStatus, ReturnCode, StatusSource};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder};
use crate::transport::{SlaveLink, Transport};

/// Request code of the kneader module.
pub const REQ_CODE: u8 = 0x24;

/// Read the kneader status.
pub const SUB_GET_STATE: u8 = 0x00;
/// Clear the error flags.
pub const SUB_CLEAR_ERROR: u8 = 0x01;
/// Spin the stirrer.
pub const SUB_RUN: u8 = 0x02;
/// Stop the stirrer.
pub const SUB_STOP: u8 = 0x03;
/// Move the bowl under a dispenser.
pub const SUB_SET_DIS_POS: u8 = 0x04;
/// Eject or retract the stirrer.
pub const SUB_SET_STIRRER_STATE: u8 = 0x05;
/// Move the positioning motor.
pub const SUB_SET_POS_SPD: u8 = 0x06;

/// Nothing running.
pub const STATE_IDLE: u8 = 0;
/// Stirrer spinning.
pub const STATE_RUNNING: u8 = 1;
/// Positioning motor moving.
pub const STATE_MOVING: u8 = 2;
/// Stirrer ejecting or retracting.
pub const STATE_EJECTING: u8 = 3;
/// Stirrer spinning down.
pub const STATE_STOPPING: u8 = 4;

/// Stirrer motor fault.
pub const FLAG_STIRRER_MOTOR_ERR: u8 = 0x01;
/// Positioning motor fault.
pub const FLAG_POSITION_MOTOR_ERR: u8 = 0x02;
/// Dispense position not reached.
pub const FLAG_DISPENSE_POS_ERR: u8 = 0x04;

/// Every fault bit.
pub const FLAG_ALL_ERRS: u8 = FLAG_STIRRER_MOTOR_ERR | FLAG_POSITION_MOTOR_ERR | FLAG_DISPENSE_POS_ERR;

/// [`Kneader::eject`] argument: pull the stirrer back.
pub const STIRRER_RETRACT: u8 = 0;
/// [`Kneader::eject`] argument: push the stirrer out.
pub const STIRRER_EJECT: u8 = 1;

/// Default execution timeout.
pub const EXE_TIMEOUT: Duration = Duration::from_millis(60_000);
/// Default spacing between status checks.
pub const CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Snapshot returned by [`Kneader::status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KneaderStatus {
    /// `STATE_*` value.
    pub state: u8,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Positioning motor position.
    pub pos: f64,
    /// Stirrer speed.
    pub rpm: f64,
    /// Stirrer motor current.
    pub current: f64,
}

impl PolledStatus for KneaderStatus {
    fn state(&self) -> u8 {
        self.state
    }

    fn has_fault(&self) -> bool {
        self.flags & FLAG_ALL_ERRS != 0
    }
}

/// Kneader driver.
pub struct Kneader<L> {
    transport: Arc<Transport<L>>,
    poller: CommandPoller,
}

impl<L: SlaveLink> Kneader<L> {
    /// Driver with the default timeout and check period.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self {
            transport,
            poller: CommandPoller::new(EXE_TIMEOUT, CHECK_PERIOD),
        }
    }

    /// Replaces the timeout and check period used by [`Kneader::wait`].
    pub fn with_poller(mut self, poller: CommandPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Reads the kneader status.
    pub async fn status(&self) -> AppResult<KneaderStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_STATE).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_STATE)?;
        let _ack = dec.read_u8()?;
        Ok(KneaderStatus {
            state: dec.read_u8()?,
            flags: dec.read_u8()?,
            pos: dec.read_q16()?,
            rpm: dec.read_q16()?,
            current: dec.read_q16()?,
        })
    }

    /// Clears the error flags.
    pub async fn clear_error_flags(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CLEAR_ERROR).build();
        send_action(&self.transport, &frame).await
    }

    /// Spins the stirrer at `speed` rpm.
    pub async fn run(&self, speed: f64) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_RUN).q16(speed).build();
        let accepted = send_action(&self.transport, &frame).await?;
        debug!(speed, accepted, "kneader run");
        Ok(Issued::new(accepted, STATE_RUNNING))
    }

    /// Stops the stirrer.
    pub async fn stop(&self) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_STOP).build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_STOPPING))
    }

    /// Moves the bowl under dispenser `id`.
    pub async fn set_dis_pos(&self, id: u8) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_DIS_POS).u8(id).build();
        let accepted = send_action_echo(&self.transport, &frame, "dispense position", id).await?;
        Ok(Issued::new(accepted, STATE_MOVING))
    }

    /// Extends (`STIRRER_EJECT`) or retracts (`STIRRER_RETRACT`) the stirrer.
    pub async fn eject(&self, state: u8) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_STIRRER_STATE)
            .u8(state)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_EJECTING))
    }

    /// Moves the positioning motor to `pos` at `speed`.
    pub async fn set_pos(&self, pos: f64, speed: f64) -> AppResult<Issued> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_POS_SPD)
            .q16(pos)
            .q16(speed)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        Ok(Issued::new(accepted, STATE_MOVING))
    }

    /// Waits for the action that put the kneader in `awaiting` to finish.
    pub async fn wait(&self, awaiting: u8) -> AppResult<ReturnCode> {
        let done = self.poller.wait(self, awaiting).await?;
        debug!(code = %done.code, status = ?done.status, "kneader wait");
        Ok(done.code)
    }
}

#[async_trait]
impl<L: SlaveLink> StatusSource for Kneader<L> {
    type Status = KneaderStatus;

    async fn query_status(&self) -> AppResult<KneaderStatus> {
        self.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;

    fn kneader(link: &MockLink) -> Kneader<MockLink> {
        Kneader::new(Arc::new(Transport::new(link.clone())))
    }

    fn status_frame(state: u8, flags: u8) -> Vec<u8> {
        FrameBuilder::new(REQ_CODE, SUB_GET_STATE)
            .u8(0)
            .u8(state)
            .u8(flags)
            .q16(90.0)
            .q16(13.0)
            .q16(1.5)
            .build()
    }

    #[tokio::test]
    async fn run_layout_and_busy_state() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_RUN, 0x00]);
        let issued = kneader(&link).run(13.0).await.unwrap();
        assert_eq!(issued.awaiting(), STATE_RUNNING);
        assert_eq!(
            link.call_log()[0],
            vec![REQ_CODE, SUB_RUN, 0x00, 0x00, 0x0d, 0x00]
        );
    }

    #[tokio::test]
    async fn busy_states_per_action() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_STOP, 0x00]);
        link.push_response(vec![REQ_CODE, SUB_SET_DIS_POS, 0x00, 2]);
        link.push_response(vec![REQ_CODE, SUB_SET_STIRRER_STATE, 0x00]);
        link.push_response(vec![REQ_CODE, SUB_SET_POS_SPD, 0x00]);
        let kn = kneader(&link);

        assert_eq!(kn.stop().await.unwrap().awaiting(), STATE_STOPPING);
        assert_eq!(kn.set_dis_pos(2).await.unwrap().awaiting(), STATE_MOVING);
        assert_eq!(kn.eject(STIRRER_EJECT).await.unwrap().awaiting(), STATE_EJECTING);
        assert_eq!(kn.set_pos(45.0, 10.0).await.unwrap().awaiting(), STATE_MOVING);
    }

    #[tokio::test]
    async fn decodes_status() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_RUNNING, 0));
        let status = kneader(&link).status().await.unwrap();
        assert_eq!(status.state, STATE_RUNNING);
        assert_eq!(status.rpm, 13.0);
        assert_eq!(status.current, 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_downgrades_on_position_fault() {
        let link = MockLink::new();
        link.push_response(status_frame(STATE_MOVING, 0));
        link.push_response(status_frame(STATE_IDLE, FLAG_POSITION_MOTOR_ERR));
        let code = kneader(&link).wait(STATE_MOVING).await.unwrap();
        assert_eq!(code, ReturnCode::ExecutionError);
    }
}
