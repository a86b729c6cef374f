//! Heater (HT) driver: top and bottom plate heaters, fans and charring elements.
//!
//! Unlike the motion modules, heater actions take effect immediately. What callers
//! wait on is a temperature, so instead of [`CommandPoller::wait`] the heater uses
//! [`CommandPoller::until`] with a temperature predicate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::command::{request, send_action};
use super::{CommandPoller, PolledStatus, ReturnCode, StatusSource};
use crate::error::AppResult;
use crate::protocol::{FrameBuilder, FrameDecoder};
use crate::transport::{SlaveLink, Transport};

/// Request code of the heater module.
pub const REQ_CODE: u8 = 0x20;

/// Read both heater channels, cold junction and line info.
pub const SUB_GET_STATE: u8 = 0x00;
/// Clear the error flags of one heater.
pub const SUB_CLEAR_ERROR: u8 = 0x01;
/// Switch a heater on or off with its temperature reference.
pub const SUB_SET_STATE: u8 = 0x02;
/// Change the temperature reference of a running heater.
pub const SUB_SET_TEMP_REF: u8 = 0x03;
/// Load PID coefficients.
pub const SUB_SET_PID: u8 = 0x04;
/// Set the over-temperature trip.
pub const SUB_SET_OVERTEMP: u8 = 0x05;
/// Switch all fans from a bit mask.
pub const SUB_SET_FAN: u8 = 0x06;
/// Switch a single fan.
pub const SUB_SET_FAN_ID: u8 = 0x07;
/// Set a single fan's PWM duty.
pub const SUB_SET_FAN_PWM: u8 = 0x08;
/// Read both charring elements.
pub const SUB_CHAR_GET: u8 = 0x10;
/// Turn a charring element on for a while.
pub const SUB_CHAR_ON: u8 = 0x11;
/// Turn a charring element off.
pub const SUB_CHAR_OFF: u8 = 0x12;
/// Put both charring elements in their safe state.
pub const SUB_CHAR_SAFE: u8 = 0x13;

/// Top plate heater.
pub const ID_TOP: u8 = 0;
/// Bottom plate heater.
pub const ID_BTM: u8 = 1;

/// Heater off.
pub const STATE_OFF: u8 = 0;
/// Heating at a fixed duty.
pub const STATE_ON_OPEN_LOOP: u8 = 1;
/// Heating under PID control.
pub const STATE_ON_CLOSE_LOOP: u8 = 2;
/// Heater tripped; see the firmware error flags.
pub const STATE_ERROR: u8 = 3;

/// Default spacing between temperature checks.
pub const CHECK_PERIOD: Duration = Duration::from_millis(500);

/// One heater's state and measured temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterChannel {
    /// `STATE_*` value.
    pub state: u8,
    /// Measured temperature, degrees C.
    pub temp: f64,
}

/// Snapshot returned by [`Heater::status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterStatus {
    /// Top plate.
    pub top: HeaterChannel,
    /// Bottom plate.
    pub btm: HeaterChannel,
    /// Thermocouple cold-junction temperature.
    pub cold_junction: f64,
    /// Mains line type detected by the board.
    pub line_type: u8,
    /// Mains frequency, Hz.
    pub line_freq: f64,
}

impl HeaterStatus {
    /// Temperature of heater `id`, or `None` for an unknown id.
    ///
    /// Only the two plate heaters, [`ID_TOP`] and [`ID_BTM`], are addressable. The
    /// charring elements reuse ids 0 and 1 but report no temperature here, so a
    /// temperature wait on any other id is a `GeneralError`, not a missing channel.
    pub fn temp(&self, id: u8) -> Option<f64> {
        match id {
            ID_TOP => Some(self.top.temp),
            ID_BTM => Some(self.btm.temp),
            _ => None,
        }
    }
}

impl PolledStatus for HeaterStatus {
    fn state(&self) -> u8 {
        self.top.state
    }

    fn has_fault(&self) -> bool {
        self.top.state == STATE_ERROR || self.btm.state == STATE_ERROR
    }
}

/// Charring element state and remaining on-time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharringChannel {
    /// Non-zero while the element is on.
    pub state: u8,
    /// Remaining on-time.
    pub time_ms: u32,
}

/// Snapshot returned by [`Heater::char_get_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharringStatus {
    /// Top charring element.
    pub top: CharringChannel,
    /// Bottom charring element.
    pub btm: CharringChannel,
}

/// Heater module driver.
pub struct Heater<L> {
    transport: Arc<Transport<L>>,
    poller: CommandPoller,
}

impl<L: SlaveLink> Heater<L> {
    /// Driver with the default check period.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self {
            transport,
            poller: CommandPoller::new(Duration::ZERO, CHECK_PERIOD),
        }
    }

    /// Overrides the spacing between temperature checks.
    pub fn with_check_period(mut self, period: Duration) -> Self {
        self.poller = CommandPoller::new(Duration::ZERO, period);
        self
    }

    /// Spacing between temperature checks.
    pub fn check_period(&self) -> Duration {
        self.poller.check_period()
    }

    /// Reads both heater channels.
    pub async fn status(&self) -> AppResult<HeaterStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_GET_STATE).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_GET_STATE)?;
        let _ack = dec.read_u8()?;
        let top = HeaterChannel {
            state: dec.read_u8()?,
            temp: dec.read_q16()?,
        };
        let btm = HeaterChannel {
            state: dec.read_u8()?,
            temp: dec.read_q16()?,
        };
        Ok(HeaterStatus {
            top,
            btm,
            cold_junction: dec.read_q16()?,
            line_type: dec.read_u8()?,
            line_freq: dec.read_q16()?,
        })
    }

    /// Clears the error flags of heater `id`.
    pub async fn clear_error_flags(&self, id: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CLEAR_ERROR).u8(id).build();
        send_action(&self.transport, &frame).await
    }

    /// Switches heater `id` to `state` with a temperature reference and duty limits.
    pub async fn set_state(
        &self,
        id: u8,
        state: u8,
        ref_temp: f64,
        max_duty: f64,
        duty_temp_ref: f64,
    ) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_STATE)
            .u8(id)
            .u8(state)
            .q16(ref_temp)
            .q16(max_duty)
            .q16(duty_temp_ref)
            .build();
        let accepted = send_action(&self.transport, &frame).await?;
        info!(id, state, ref_temp, accepted, "heater state");
        Ok(accepted)
    }

    /// Changes the temperature reference and duty limits of heater `id`.
    pub async fn set_temp_ref(
        &self,
        id: u8,
        ref_temp: f64,
        max_duty: f64,
        duty_temp_ref: f64,
    ) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_TEMP_REF)
            .u8(id)
            .q16(ref_temp)
            .q16(max_duty)
            .q16(duty_temp_ref)
            .build();
        send_action(&self.transport, &frame).await
    }

    /// Loads PID coefficients and output saturation for heater `id`.
    pub async fn set_pid(&self, id: u8, a: f64, b: f64, c: f64, saturation: f64) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_PID)
            .u8(id)
            .q16(a)
            .q16(b)
            .q16(c)
            .q16(saturation)
            .build();
        send_action(&self.transport, &frame).await
    }

    /// Sets the over-temperature trip: `temp` sustained for `duration_ms`.
    pub async fn set_overtemp(&self, id: u8, temp: f64, duration_ms: u32) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_OVERTEMP)
            .u8(id)
            .q16(temp)
            .u32(duration_ms)
            .build();
        send_action(&self.transport, &frame).await
    }

    /// Switches every fan at once, one bit per fan.
    pub async fn set_fan(&self, mask: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_FAN).u8(mask).build();
        send_action(&self.transport, &frame).await
    }

    /// Switches fan `fan` on (non-zero `state`) or off.
    pub async fn set_fan_id(&self, fan: u8, state: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_FAN_ID)
            .u8(fan)
            .u8(state)
            .build();
        send_action(&self.transport, &frame).await
    }

    /// Sets the PWM duty of fan `fan`, in percent.
    pub async fn set_fan_pwm(&self, fan: u8, duty: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_SET_FAN_PWM)
            .u8(fan)
            .u8(duty)
            .build();
        send_action(&self.transport, &frame).await
    }

    /// Reads both charring elements.
    pub async fn char_get_state(&self) -> AppResult<CharringStatus> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CHAR_GET).build();
        let reply = request(&self.transport, &frame).await?;
        let mut dec = FrameDecoder::new(&reply, REQ_CODE, SUB_CHAR_GET)?;
        let _ack = dec.read_u8()?;
        let top = CharringChannel {
            state: dec.read_u8()?,
            time_ms: dec.read_u32()?,
        };
        let btm = CharringChannel {
            state: dec.read_u8()?,
            time_ms: dec.read_u32()?,
        };
        Ok(CharringStatus { top, btm })
    }

    /// Turns charring element `id` on for `on_time_ms`.
    pub async fn char_on(&self, id: u8, on_time_ms: u16) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CHAR_ON)
            .u8(id)
            .u16(on_time_ms)
            .build();
        send_action(&self.transport, &frame).await
    }

    /// Turns charring element `id` off.
    pub async fn char_off(&self, id: u8) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CHAR_OFF).u8(id).build();
        send_action(&self.transport, &frame).await
    }

    /// Puts both charring elements in their safe state.
    pub async fn char_safe(&self) -> AppResult<bool> {
        let frame = FrameBuilder::new(REQ_CODE, SUB_CHAR_SAFE).build();
        send_action(&self.transport, &frame).await
    }

    /// Waits for heater `id` to cool to `temp` or below.
    pub async fn wait_le(&self, id: u8, temp: f64, timeout: Duration) -> AppResult<ReturnCode> {
        self.wait_temp(id, timeout, move |t| t <= temp).await
    }

    /// Waits for heater `id` to reach `temp` or above.
    pub async fn wait_ge(&self, id: u8, temp: f64, timeout: Duration) -> AppResult<ReturnCode> {
        self.wait_temp(id, timeout, move |t| t >= temp).await
    }

    /// Waits until both heaters sit strictly within `tol` of their targets.
    pub async fn wait_eq(
        &self,
        top: f64,
        btm: f64,
        tol: f64,
        timeout: Duration,
    ) -> AppResult<ReturnCode> {
        let within = move |actual: f64, expected: f64| {
            actual > expected - tol && actual < expected + tol
        };
        let done = self
            .poller
            .until(self, timeout, |s| {
                within(s.top.temp, top) && within(s.btm.temp, btm)
            })
            .await?;
        debug!(code = %done.code, status = ?done.status, top, btm, tol, "heater wait eq");
        Ok(done.code)
    }

    async fn wait_temp<F>(&self, id: u8, timeout: Duration, reached: F) -> AppResult<ReturnCode>
    where
        F: Fn(f64) -> bool + Send + Sync,
    {
        if id != ID_TOP && id != ID_BTM {
            warn!(id, "invalid heater id");
            return Ok(ReturnCode::GeneralError);
        }
        let done = self
            .poller
            .until(self, timeout, |s| s.temp(id).is_some_and(&reached))
            .await?;
        debug!(code = %done.code, status = ?done.status, id, "heater wait");
        Ok(done.code)
    }
}

#[async_trait]
impl<L: SlaveLink> StatusSource for Heater<L> {
    type Status = HeaterStatus;

    async fn query_status(&self) -> AppResult<HeaterStatus> {
        self.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;

    fn heater(link: &MockLink) -> Heater<MockLink> {
        Heater::new(Arc::new(Transport::new(link.clone())))
    }

    fn status_frame(top: f64, btm: f64) -> Vec<u8> {
        FrameBuilder::new(REQ_CODE, SUB_GET_STATE)
            .u8(0)
            .u8(STATE_ON_CLOSE_LOOP)
            .q16(top)
            .u8(STATE_ON_CLOSE_LOOP)
            .q16(btm)
            .q16(25.0)
            .u8(1)
            .q16(50.0)
            .build()
    }

    #[tokio::test]
    async fn decodes_status() {
        let link = MockLink::new();
        link.push_response(status_frame(180.5, 210.25));
        let status = heater(&link).status().await.unwrap();
        assert_eq!(status.top.temp, 180.5);
        assert_eq!(status.btm.temp, 210.25);
        assert_eq!(status.temp(ID_BTM), Some(210.25));
        assert_eq!(status.temp(7), None);
        assert_eq!(status.line_freq, 50.0);
        assert!(!status.has_fault());
    }

    #[tokio::test]
    async fn set_state_layout() {
        let link = MockLink::new();
        link.push_response(vec![REQ_CODE, SUB_SET_STATE, 0x00]);
        let accepted = heater(&link)
            .set_state(ID_TOP, STATE_ON_CLOSE_LOOP, 200.0, 0.8, 150.0)
            .await
            .unwrap();
        assert!(accepted);
        let frame = &link.call_log()[0];
        assert_eq!(&frame[..4], &[REQ_CODE, SUB_SET_STATE, ID_TOP, STATE_ON_CLOSE_LOOP]);
        assert_eq!(frame.len(), 4 + 12);
    }

    #[tokio::test]
    async fn decodes_charring_status() {
        let link = MockLink::new();
        link.push_response(
            FrameBuilder::new(REQ_CODE, SUB_CHAR_GET)
                .u8(0)
                .u8(1)
                .u32(1500)
                .u8(0)
                .u32(0)
                .build(),
        );
        let status = heater(&link).char_get_state().await.unwrap();
        assert_eq!(status.top, CharringChannel { state: 1, time_ms: 1500 });
        assert_eq!(status.btm.state, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ge_returns_once_hot() {
        let link = MockLink::new();
        link.push_response(status_frame(150.0, 100.0));
        link.push_response(status_frame(190.0, 120.0));
        link.push_response(status_frame(201.0, 130.0));
        let code = heater(&link)
            .wait_ge(ID_TOP, 200.0, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(code, ReturnCode::NoError);
        assert_eq!(link.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_le_times_out() {
        let link = MockLink::new();
        link.set_responder(|_| Some(status_frame(150.0, 150.0)));
        let code = heater(&link)
            .wait_le(ID_BTM, 100.0, Duration::from_millis(2000))
            .await
            .unwrap();
        assert_eq!(code, ReturnCode::TimeoutError);
        assert_eq!(link.call_count(), 4);
    }

    #[tokio::test]
    async fn invalid_id_is_general_error() {
        let link = MockLink::new();
        let code = heater(&link)
            .wait_le(5, 100.0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(code, ReturnCode::GeneralError);
        assert_eq!(link.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_eq_band_is_strict() {
        let link = MockLink::new();
        // exactly on the band edge is not inside
        link.push_response(status_frame(205.0, 200.0));
        link.push_response(status_frame(204.5, 199.0));
        let code = heater(&link)
            .wait_eq(200.0, 200.0, 5.0, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, ReturnCode::NoError);
        assert_eq!(link.call_count(), 2);
    }
}
