//! Background stage workers.
//!
//! A worker owns a [`StepSequencer`] and a fixed list of stages. It sits idle until
//! a controller sends a [`StartRequest`], runs every stage in order, answers on the
//! request's oneshot channel and goes back to waiting. The controller can carry on
//! with its own steps between [`StageHandle::start`] and [`PendingRun::wait`].
//!
//! ```text
//! controller                 worker task
//!     │ start() ──StartRequest──▶ │
//!     │ (own steps)               │ stage 0, stage 1, ...
//!     │ wait()  ◀──StageReport─── │
//! ```

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{AppResult, MasterError};
use crate::modules::{heater, ReturnCode};
use crate::sequencer::{HeaterOp, KneaderOp, Step, StepSequencer, VerticalTrayOp};
use crate::transport::SlaveLink;

/// Queued start requests per worker.
const START_QUEUE: usize = 4;

/// A named list of steps run as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Name used in logs.
    pub name: String,
    /// Steps run by the sequencer.
    pub steps: Vec<Step>,
}

impl Stage {
    /// Stage named `name` running `steps`.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

/// What one run of a worker produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    /// First non-`NoError` code, or `NoError` when every stage passed.
    pub code: ReturnCode,
    /// Elapsed time of every stage that ran, in order.
    pub stage_times: Vec<Duration>,
    /// Sum of `stage_times`.
    pub total: Duration,
    /// Index of the stage that returned `code`, when it is not `NoError`.
    pub failed_stage: Option<usize>,
}

impl Default for StageReport {
    fn default() -> Self {
        Self {
            code: ReturnCode::NoError,
            stage_times: Vec::new(),
            total: Duration::ZERO,
            failed_stage: None,
        }
    }
}

/// Begin event for a worker. The reply is the end event.
#[derive(Debug)]
pub struct StartRequest {
    /// Where the report is sent when the run ends.
    pub reply: oneshot::Sender<AppResult<StageReport>>,
}

/// Background worker that runs its stages once per start request.
pub struct StageWorker<L> {
    name: String,
    sequencer: StepSequencer<L>,
    stages: Vec<Stage>,
    safe_steps: Vec<Step>,
}

impl<L: SlaveLink + 'static> StageWorker<L> {
    /// Worker running `stages` with its own `sequencer`.
    pub fn new(name: impl Into<String>, sequencer: StepSequencer<L>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            sequencer,
            stages,
            safe_steps: Vec::new(),
        }
    }

    /// Steps run after a failed stage to leave the machine in a safe state.
    pub fn with_safe_steps(mut self, steps: Vec<Step>) -> Self {
        self.safe_steps = steps;
        self
    }

    /// Starts the worker task.
    ///
    /// The task ends once every [`StageHandle`] clone has been dropped.
    pub fn spawn(self) -> (StageHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(START_QUEUE);
        let name = self.name.clone();
        let task = tokio::spawn(self.run(rx));
        (StageHandle { name, tx }, task)
    }

    async fn run(mut self, mut start_rx: mpsc::Receiver<StartRequest>) {
        info!(worker = %self.name, stages = self.stages.len(), "stage worker started");

        while let Some(request) = start_rx.recv().await {
            let result = self.run_stages().await;
            if request.reply.send(result).is_err() {
                warn!(worker = %self.name, "requester dropped before the run finished");
            }
        }

        info!(worker = %self.name, "stage worker stopped");
    }

    async fn run_stages(&mut self) -> AppResult<StageReport> {
        let mut report = StageReport::default();

        for index in 0..self.stages.len() {
            let stage = &self.stages[index];
            let name = stage.name.clone();
            let outcome = self.sequencer.execute(&stage.steps).await;

            let (code, elapsed) = match outcome {
                Ok(done) => done,
                Err(e) => {
                    error!(worker = %self.name, stage = %name, error = %e, "stage aborted");
                    self.make_safe().await;
                    return Err(e);
                }
            };

            report.stage_times.push(elapsed);
            report.total += elapsed;
            info!(
                worker = %self.name,
                stage = %name,
                code = %code,
                elapsed_ms = elapsed.as_millis() as u64,
                "stage done"
            );

            if !code.is_ok() {
                report.code = code;
                report.failed_stage = Some(index);
                self.make_safe().await;
                break;
            }
        }

        Ok(report)
    }

    async fn make_safe(&mut self) {
        if self.safe_steps.is_empty() {
            return;
        }
        let steps = self.safe_steps.clone();
        match self.sequencer.execute(&steps).await {
            Ok((code, _)) => info!(worker = %self.name, code = %code, "safe state applied"),
            Err(e) => error!(worker = %self.name, error = %e, "safe state failed"),
        }
    }
}

/// Controller side of a worker.
#[derive(Debug, Clone)]
pub struct StageHandle {
    name: String,
    tx: mpsc::Sender<StartRequest>,
}

impl StageHandle {
    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the worker to begin a run and returns without waiting for it.
    pub async fn start(&self) -> AppResult<PendingRun> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StartRequest { reply })
            .await
            .map_err(|_| MasterError::WorkerStopped)?;
        Ok(PendingRun { rx })
    }

    /// Starts a run and waits for its report.
    pub async fn run(&self) -> AppResult<StageReport> {
        self.start().await?.wait().await
    }
}

/// A started run whose report has not been collected yet.
#[derive(Debug)]
pub struct PendingRun {
    rx: oneshot::Receiver<AppResult<StageReport>>,
}

impl PendingRun {
    /// Waits for the report of the started run.
    pub async fn wait(self) -> AppResult<StageReport> {
        self.rx.await.map_err(|_| MasterError::WorkerStopped)?
    }
}

/// One kneading phase: tray height, stirrer speed and duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KneadPhase {
    /// Offset below the tray top limit.
    pub vt_offset: f64,
    /// Tray speed for the move into position.
    pub vt_speed: f64,
    /// Stirrer speed, rpm.
    pub kn_speed: f64,
    /// How long the phase lasts.
    pub time_ms: u64,
}

/// How the kneader is left after the last phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KneadFinish {
    /// Stop the stirrer and wait for it to spin down.
    Stop,
    /// Move the kneader to a parking position.
    SetPos {
        /// Parking position.
        pos: f64,
        /// Move speed.
        speed: f64,
    },
}

/// Expands kneading phases into tray, stirrer and sleep steps.
pub fn kneading_steps(phases: &[KneadPhase], finish: KneadFinish) -> Vec<Step> {
    let mut steps = Vec::with_capacity(phases.len() * 3 + 1);
    for phase in phases {
        steps.push(Step::VerticalTray(VerticalTrayOp::MoveTop {
            offset: phase.vt_offset,
            speed: phase.vt_speed,
        }));
        steps.push(Step::Kneader(KneaderOp::Run {
            speed: phase.kn_speed,
        }));
        steps.push(Step::Sleep {
            ms: phase.time_ms,
        });
    }
    steps.push(Step::Kneader(match finish {
        KneadFinish::Stop => KneaderOp::Stop,
        KneadFinish::SetPos { pos, speed } => KneaderOp::SetPos { pos, speed },
    }));
    steps
}

/// Stages of the dispense-and-knead worker.
pub fn dak_stages(dispense: Vec<Step>, knead: Vec<Step>) -> Vec<Stage> {
    vec![Stage::new("dispense", dispense), Stage::new("knead", knead)]
}

/// Stages of the press-and-roast worker.
pub fn upr_stages(press: Vec<Step>, roast: Vec<Step>) -> Vec<Stage> {
    vec![Stage::new("press", press), Stage::new("roast", roast)]
}

/// Both heaters off.
pub fn heaters_off() -> Vec<Step> {
    vec![
        Step::Heater(HeaterOp::Off { id: heater::ID_TOP }),
        Step::Heater(HeaterOp::Off { id: heater::ID_BTM }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{kneader, Drivers};
    use crate::protocol::FrameBuilder;
    use crate::sequencer::{ModuleGate, SequencerSettings};
    use crate::transport::{MockLink, Transport};
    use std::sync::Arc;

    fn sequencer(link: &MockLink) -> StepSequencer<MockLink> {
        let drivers = Drivers::new(Arc::new(Transport::new(link.clone())));
        StepSequencer::new(
            Arc::new(drivers),
            ModuleGate::new(),
            SequencerSettings::default(),
        )
    }

    /// Plays a kneader that ACKs everything and is always idle.
    fn idle_kneader(frame: &[u8]) -> Option<Vec<u8>> {
        match (frame[0], frame[1]) {
            (kneader::REQ_CODE, kneader::SUB_GET_STATE) => Some(
                FrameBuilder::new(kneader::REQ_CODE, kneader::SUB_GET_STATE)
                    .u8(0)
                    .u8(kneader::STATE_IDLE)
                    .u8(0)
                    .q16(0.0)
                    .q16(0.0)
                    .q16(0.0)
                    .build(),
            ),
            (module, sub) => Some(vec![module, sub, 0x00]),
        }
    }

    #[test]
    fn kneading_phases_expand_in_order() {
        let phases = [
            KneadPhase {
                vt_offset: 10.0,
                vt_speed: 20.0,
                kn_speed: 13.0,
                time_ms: 5000,
            },
            KneadPhase {
                vt_offset: 4.0,
                vt_speed: 5.0,
                kn_speed: 30.0,
                time_ms: 1000,
            },
        ];
        let steps = kneading_steps(&phases, KneadFinish::SetPos { pos: 90.0, speed: 10.0 });
        assert_eq!(steps.len(), 7);
        assert_eq!(
            steps[0],
            Step::VerticalTray(VerticalTrayOp::MoveTop {
                offset: 10.0,
                speed: 20.0
            })
        );
        assert_eq!(steps[5], Step::Sleep { ms: 1000 });
        assert_eq!(
            steps[6],
            Step::Kneader(KneaderOp::SetPos {
                pos: 90.0,
                speed: 10.0
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn worker_runs_stages_on_request() {
        let link = MockLink::with_responder(idle_kneader);
        let stages = dak_stages(
            vec![Step::Sleep { ms: 200 }],
            kneading_steps(&[], KneadFinish::Stop),
        );
        let (handle, _task) = StageWorker::new("dak", sequencer(&link), stages).spawn();

        let pending = handle.start().await.unwrap();
        let report = pending.wait().await.unwrap();

        assert_eq!(report.code, ReturnCode::NoError);
        assert_eq!(report.stage_times.len(), 2);
        assert!(report.stage_times[0] >= Duration::from_millis(200));
        assert_eq!(report.failed_stage, None);
        assert_eq!(link.calls_with(kneader::REQ_CODE, kneader::SUB_STOP), 1);

        // The worker loops back and serves a second request with a fresh report.
        let again = handle.run().await.unwrap();
        assert_eq!(again.stage_times.len(), 2);
        assert_eq!(link.calls_with(kneader::REQ_CODE, kneader::SUB_STOP), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stage_stops_run_and_applies_safe_state() {
        let link = MockLink::with_responder(|frame: &[u8]| match (frame[0], frame[1]) {
            (kneader::REQ_CODE, kneader::SUB_RUN) => Some(vec![frame[0], frame[1], 0x01]),
            (module, sub) => Some(vec![module, sub, 0x00]),
        });
        let stages = upr_stages(
            vec![Step::Kneader(KneaderOp::Run { speed: 10.0 })],
            vec![Step::Kneader(KneaderOp::Stop)],
        );
        let (handle, _task) = StageWorker::new("upr", sequencer(&link), stages)
            .with_safe_steps(heaters_off())
            .spawn();

        let report = handle.run().await.unwrap();

        assert_eq!(report.code, ReturnCode::SendError);
        assert_eq!(report.failed_stage, Some(0));
        assert_eq!(report.stage_times.len(), 1);
        assert_eq!(link.calls_with(kneader::REQ_CODE, kneader::SUB_STOP), 0);
        assert_eq!(link.calls_with(heater::REQ_CODE, heater::SUB_SET_STATE), 2);
    }

    #[tokio::test]
    async fn driver_error_is_reported_to_controller() {
        let link = MockLink::new();
        let stages = vec![Stage::new("knead", vec![Step::Kneader(KneaderOp::Stop)])];
        let (handle, _task) = StageWorker::new("dak", sequencer(&link), stages).spawn();

        let err = handle.run().await.unwrap_err();
        assert!(matches!(err, MasterError::NoResponse { .. }));
    }

    #[tokio::test]
    async fn stopped_worker_is_an_error() {
        let link = MockLink::new();
        let (handle, task) = StageWorker::new("dak", sequencer(&link), Vec::new()).spawn();
        task.abort();
        let _ = task.await;

        let err = handle.run().await.unwrap_err();
        assert!(matches!(err, MasterError::WorkerStopped));
    }
}
