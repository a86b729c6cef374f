//! Step sequencer: runs a recipe against the module drivers.
//!
//! Steps execute strictly in order, each fully resolved (including any wait) before
//! the next one starts. The first step that does not return
//! [`ReturnCode::NoError`] stops the run; later steps are never sent. Elapsed time
//! is accumulated per step and returned with the final code, so a failed run still
//! reports how long it took to fail.
//!
//! Driver errors (`NoResponse`, `ProtocolMismatch`, ...) are not return codes. They
//! abort the run with `Err`.
//!
//! Non-blocking actions leave a pending busy state behind. A later `wait` step on
//! the same module consumes it. Dispenses always block, so the dispenser never
//! holds one.

pub mod gate;
pub mod step;

pub use gate::{ModuleGate, ModuleTag};
pub use step::{
    parse_recipe, parse_steps, CommandDescriptor, DispenserOp, FanOp, HeaterOp, KickerOp,
    KneaderOp, Recipe, Step, VerticalTrayOp, WedgePressOp,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::error::AppResult;
use crate::modules::{heater, Drivers, Issued, ReturnCode, IDLE_STATE};
use crate::transport::SlaveLink;

/// Vertical-tray top limit assumed until one is measured.
pub const DEFAULT_VT_TOP_LIMIT: f64 = 47.0;

/// Values the sequencer needs beyond the drivers and the gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequencerSettings {
    /// Position `move_top` offsets are measured down from.
    pub vt_top_limit: f64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            vt_top_limit: DEFAULT_VT_TOP_LIMIT,
        }
    }
}

/// Runs typed recipe steps against the drivers.
pub struct StepSequencer<L> {
    drivers: Arc<Drivers<L>>,
    gate: ModuleGate,
    settings: SequencerSettings,
    pending: HashMap<ModuleTag, u8>,
}

impl<L: SlaveLink> StepSequencer<L> {
    /// Sequencer over `drivers` with an explicit gate and settings.
    pub fn new(drivers: Arc<Drivers<L>>, gate: ModuleGate, settings: SequencerSettings) -> Self {
        Self {
            drivers,
            gate,
            settings,
            pending: HashMap::new(),
        }
    }

    /// Builds a sequencer with the gate and settings from `config`.
    pub fn from_config(drivers: Arc<Drivers<L>>, config: &MasterConfig) -> Self {
        let mut gate = ModuleGate::from_config(&config.gate);
        gate.set_sleep_enabled(config.sequencer.sleep_enabled);
        let settings = SequencerSettings {
            vt_top_limit: config.sequencer.vt_top_limit,
        };
        Self::new(drivers, gate, settings)
    }

    /// Drivers the steps run against.
    pub fn drivers(&self) -> &Arc<Drivers<L>> {
        &self.drivers
    }

    /// Current module gate.
    pub fn gate(&self) -> &ModuleGate {
        &self.gate
    }

    /// Gate adjustments apply from the next `execute` call.
    pub fn gate_mut(&mut self) -> &mut ModuleGate {
        &mut self.gate
    }

    /// Current settings.
    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    /// Replaces the top limit, typically with one measured by the vertical tray.
    pub fn set_vt_top_limit(&mut self, limit: f64) {
        self.settings.vt_top_limit = limit;
    }

    /// Runs `steps` in order, stopping at the first failure.
    pub async fn execute(&mut self, steps: &[Step]) -> AppResult<(ReturnCode, Duration)> {
        let mut total = Duration::ZERO;

        for (index, step) in steps.iter().enumerate() {
            if !self.gate.is_available(step.module()) {
                debug!(index, step = ?step, "module disabled, step skipped");
                continue;
            }

            let started = Instant::now();
            let code = self.dispatch(step).await?;
            let elapsed = started.elapsed();
            total += elapsed;

            info!(
                index,
                step = ?step,
                code = %code,
                elapsed_ms = elapsed.as_millis() as u64,
                "step done"
            );

            if !code.is_ok() {
                warn!(index, code = %code, total_ms = total.as_millis() as u64, "sequence stopped");
                return Ok((code, total));
            }
        }

        Ok((ReturnCode::NoError, total))
    }

    async fn dispatch(&mut self, step: &Step) -> AppResult<ReturnCode> {
        match step {
            Step::Kneader(op) => self.kneader(op).await,
            Step::Dispenser(op) => self.dispenser(op).await,
            Step::VerticalTray(op) => self.vertical_tray(op).await,
            Step::WedgePress(op) => self.wedge_press(op).await,
            Step::Kicker(op) => self.kicker(op).await,
            Step::Heater(op) => self.heater(op).await,
            Step::Fan(op) => self.fan(op).await,
            Step::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(ReturnCode::NoError)
            }
        }
    }

    /// Records a non-blocking action and reports whether it was accepted.
    fn started(&mut self, key: ModuleTag, issued: Issued) -> ReturnCode {
        if !issued.accepted() {
            return ReturnCode::SendError;
        }
        self.pending.insert(key, issued.awaiting());
        ReturnCode::NoError
    }

    /// Busy state left by the last non-blocking action on `key`, if any.
    fn take_pending(&mut self, key: ModuleTag) -> Option<u8> {
        self.pending
            .remove(&key)
            .filter(|&awaiting| awaiting != IDLE_STATE)
    }

    async fn kneader(&mut self, op: &KneaderOp) -> AppResult<ReturnCode> {
        let drivers = Arc::clone(&self.drivers);
        let kn = &drivers.kneader;
        let key = ModuleTag::Kneader;
        let issued = match *op {
            KneaderOp::Run { speed } => kn.run(speed).await?,
            KneaderOp::Stop => kn.stop().await?,
            KneaderOp::SetDisPos { id } => kn.set_dis_pos(id).await?,
            KneaderOp::Eject { state } => kn.eject(state).await?,
            KneaderOp::SetPos { pos, speed } => kn.set_pos(pos, speed).await?,
            KneaderOp::Wait => {
                return match self.take_pending(key) {
                    Some(awaiting) => kn.wait(awaiting).await,
                    None => Ok(ReturnCode::NoError),
                };
            }
        };
        Ok(self.started(key, issued))
    }

    async fn dispenser(&mut self, op: &DispenserOp) -> AppResult<ReturnCode> {
        let drivers = Arc::clone(&self.drivers);
        let ds = &drivers.dispenser;
        let (id, issued) = match *op {
            DispenserOp::Weight { id, weight, speed } => {
                (id, ds.dispense_by_weight(id, weight, speed, true).await?)
            }
            DispenserOp::Time { id, time_ms, speed } => {
                (id, ds.dispense_by_time(id, time_ms, speed).await?)
            }
            DispenserOp::Tare => {
                let issued = ds.tare().await?;
                debug!(accepted = issued.accepted(), "dispenser tare");
                return Ok(ReturnCode::NoError);
            }
        };
        if !issued.accepted() {
            return Ok(ReturnCode::SendError);
        }
        ds.wait(id, issued.awaiting()).await
    }

    async fn vertical_tray(&mut self, op: &VerticalTrayOp) -> AppResult<ReturnCode> {
        let drivers = Arc::clone(&self.drivers);
        let vt = &drivers.vertical_tray;
        let key = ModuleTag::VerticalTray;
        let top = self.settings.vt_top_limit;
        let (issued, block) = match *op {
            VerticalTrayOp::MoveBlock { pos, speed } => (vt.move_to(false, pos, speed).await?, true),
            VerticalTrayOp::MoveNonBlock { pos, speed } => {
                (vt.move_to(false, pos, speed).await?, false)
            }
            VerticalTrayOp::MoveTop { offset, speed } => {
                (vt.move_to(false, top - offset, speed).await?, true)
            }
            VerticalTrayOp::MoveTopNonBlock { offset, speed } => {
                (vt.move_to(false, top - offset, speed).await?, false)
            }
            VerticalTrayOp::Wait => {
                return match self.take_pending(key) {
                    Some(awaiting) => vt.wait(awaiting).await,
                    None => Ok(ReturnCode::NoError),
                };
            }
        };
        if !block {
            return Ok(self.started(key, issued));
        }
        if !issued.accepted() {
            return Ok(ReturnCode::SendError);
        }
        vt.wait(issued.awaiting()).await
    }

    async fn wedge_press(&mut self, op: &WedgePressOp) -> AppResult<ReturnCode> {
        let drivers = Arc::clone(&self.drivers);
        let wp = &drivers.wedge_press;
        let key = ModuleTag::WedgePress;
        let issued = match *op {
            WedgePressOp::Async {
                press,
                pivot,
                time_ms,
            } => {
                let issued = wp.move_absolute(press, pivot, time_ms).await?;
                return Ok(self.started(key, issued));
            }
            WedgePressOp::Wait => {
                return match self.take_pending(key) {
                    Some(awaiting) => wp.wait(awaiting).await,
                    None => Ok(ReturnCode::NoError),
                };
            }
            WedgePressOp::Press { pos, time_ms } => wp.move_press(pos, time_ms).await?,
            WedgePressOp::Wedge { pos, time_ms } => wp.move_wedge(pos, time_ms).await?,
            WedgePressOp::Move {
                press,
                pivot,
                time_ms,
            } => wp.move_absolute(press, pivot, time_ms).await?,
        };
        if !issued.accepted() {
            return Ok(ReturnCode::SendError);
        }
        wp.wait(issued.awaiting()).await
    }

    async fn kicker(&self, op: &KickerOp) -> AppResult<ReturnCode> {
        let kr = &self.drivers.kicker;
        match *op {
            KickerOp::Abs { pos, speed } => {
                let issued = kr.move_to(false, pos, speed).await?;
                if !issued.accepted() {
                    return Ok(ReturnCode::SendError);
                }
                kr.wait(issued.awaiting()).await
            }
            KickerOp::Rel {
                target,
                step,
                speed,
                delay_ms,
            } => {
                let start = kr.status().await?.pos;
                let max_moves = relative_move_budget(start, target, step);
                let mut pos = start;
                let mut moves = 0;
                let mut code = ReturnCode::NoError;

                while pos < target - step {
                    if moves == max_moves {
                        warn!(start, pos, target, moves, "kicker move budget spent");
                        return Ok(ReturnCode::ExecutionError);
                    }
                    moves += 1;

                    let issued = kr.move_to(true, step, speed).await?;
                    if !issued.accepted() {
                        code = ReturnCode::SendError;
                        break;
                    }
                    code = kr.wait(issued.awaiting()).await?;
                    if !code.is_ok() {
                        break;
                    }
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    let previous = pos;
                    pos = kr.status().await?.pos;
                    debug!(pos, target, "kicker step");
                    if pos <= previous {
                        warn!(pos, target, "kicker stalled");
                        return Ok(ReturnCode::ExecutionError);
                    }
                }

                if code.is_ok() && pos < target {
                    let issued = kr.move_to(false, target, speed).await?;
                    if !issued.accepted() {
                        return Ok(ReturnCode::SendError);
                    }
                    code = kr.wait(issued.awaiting()).await?;
                }
                Ok(code)
            }
        }
    }

    async fn heater(&self, op: &HeaterOp) -> AppResult<ReturnCode> {
        let ht = &self.drivers.heater;
        match *op {
            HeaterOp::On {
                id,
                temp,
                duty_max,
                duty_threshold,
            } => {
                ht.set_state(id, heater::STATE_ON_OPEN_LOOP, temp, duty_max, duty_threshold)
                    .await?;
                Ok(ReturnCode::NoError)
            }
            HeaterOp::Off { id } => {
                ht.set_state(id, heater::STATE_OFF, 0.0, 0.0, 0.0).await?;
                Ok(ReturnCode::NoError)
            }
            HeaterOp::Le {
                id,
                temp,
                timeout_ms,
            } => ht.wait_le(id, temp, Duration::from_millis(timeout_ms)).await,
            HeaterOp::Ge {
                id,
                temp,
                timeout_ms,
            } => ht.wait_ge(id, temp, Duration::from_millis(timeout_ms)).await,
            HeaterOp::Eq {
                top,
                btm,
                tol,
                timeout_ms,
            } => {
                ht.wait_eq(top, btm, tol, Duration::from_millis(timeout_ms))
                    .await
            }
            HeaterOp::CharOn { id, time_ms } => {
                ht.char_on(id, time_ms).await?;
                Ok(ReturnCode::NoError)
            }
            HeaterOp::CharOff { id } => {
                ht.char_off(id).await?;
                Ok(ReturnCode::NoError)
            }
        }
    }

    async fn fan(&self, op: &FanOp) -> AppResult<ReturnCode> {
        let ht = &self.drivers.heater;
        let accepted = match *op {
            FanOp::Id { fan, state } => ht.set_fan_id(fan, state).await?,
            FanOp::Pwm { fan, duty } => ht.set_fan_pwm(fan, duty).await?,
            FanOp::Mask { mask } => ht.set_fan(mask).await?,
        };
        debug!(op = ?op, accepted, "fan");
        Ok(ReturnCode::NoError)
    }
}

/// Relative moves a `Rel` step may issue before it is declared stuck: one per
/// full step between `start` and `target`, plus two for rounding at either end.
fn relative_move_budget(start: f64, target: f64, step: f64) -> u32 {
    let span = (target - start).max(0.0);
    (span / step).ceil() as u32 + 2
}
