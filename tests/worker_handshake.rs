//! Stage workers driven by a controller sharing the same board.

use roti_master::modules::{dispenser, kneader, vertical_tray, wedge_press, Drivers, ReturnCode};
use roti_master::sequencer::{
    DispenserOp, ModuleGate, SequencerSettings, Step, StepSequencer, WedgePressOp,
};
use roti_master::transport::{MockLink, Transport};
use roti_master::workers::{
    dak_stages, heaters_off, kneading_steps, upr_stages, KneadFinish, KneadPhase, StageWorker,
};
use roti_master::MasterError;
use std::sync::Arc;
use std::time::Duration;

fn shared_drivers(link: &MockLink) -> Arc<Drivers<MockLink>> {
    Arc::new(Drivers::new(Arc::new(Transport::new(link.clone()))))
}

fn sequencer(drivers: &Arc<Drivers<MockLink>>) -> StepSequencer<MockLink> {
    StepSequencer::new(
        Arc::clone(drivers),
        ModuleGate::new(),
        SequencerSettings::default(),
    )
}

fn dak_worker(drivers: &Arc<Drivers<MockLink>>) -> StageWorker<MockLink> {
    let dispense = vec![
        Step::Dispenser(DispenserOp::Weight {
            id: dispenser::ID_FLOUR,
            weight: 100.0,
            speed: 40.0,
        }),
        Step::Dispenser(DispenserOp::Time {
            id: dispenser::ID_WATER,
            time_ms: 2500,
            speed: 20.0,
        }),
    ];
    let knead = kneading_steps(
        &[
            KneadPhase {
                vt_offset: 12.0,
                vt_speed: 20.0,
                kn_speed: 13.0,
                time_ms: 4000,
            },
            KneadPhase {
                vt_offset: 6.0,
                vt_speed: 10.0,
                kn_speed: 30.0,
                time_ms: 2000,
            },
        ],
        KneadFinish::Stop,
    );
    StageWorker::new("dak", sequencer(drivers), dak_stages(dispense, knead))
}

#[tokio::test(start_paused = true)]
async fn controller_works_while_dak_runs() {
    let link = MockLink::dry_run().with_latency(Duration::from_millis(5));
    let drivers = shared_drivers(&link);
    let (dak, _task) = dak_worker(&drivers).spawn();
    let mut controller = sequencer(&drivers);

    let pending = dak.start().await.unwrap();
    let press = [Step::WedgePress(WedgePressOp::Press {
        pos: 4.0,
        time_ms: 600,
    })];
    let (report, own) = futures::join!(pending.wait(), controller.execute(&press));

    let report = report.unwrap();
    assert_eq!(report.code, ReturnCode::NoError);
    assert_eq!(report.stage_times.len(), 2);
    assert!(report.stage_times[1] >= Duration::from_millis(6000));
    assert_eq!(report.total, report.stage_times.iter().sum::<Duration>());
    assert_eq!(own.unwrap().0, ReturnCode::NoError);

    assert_eq!(link.calls_with(vertical_tray::REQ_CODE, vertical_tray::SUB_MOVE), 2);
    assert_eq!(link.calls_with(kneader::REQ_CODE, kneader::SUB_RUN), 2);
    assert_eq!(link.calls_with(wedge_press::REQ_CODE, wedge_press::SUB_MOVE_PRESS), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_serves_repeated_runs() {
    let link = MockLink::dry_run();
    let drivers = shared_drivers(&link);
    let (dak, _task) = dak_worker(&drivers).spawn();

    let first = dak.run().await.unwrap();
    let second = dak.clone().run().await.unwrap();

    assert_eq!(first.code, ReturnCode::NoError);
    assert_eq!(second.stage_times.len(), 2);
    assert_eq!(link.calls_with(kneader::REQ_CODE, kneader::SUB_STOP), 2);
}

#[test]
fn upr_failure_turns_heaters_off() {
    tokio_test::block_on(async {
        let link = MockLink::dry_run();
        // The first press command is refused.
        link.push_response(vec![wedge_press::REQ_CODE, wedge_press::SUB_MOVE_PRESS, 0x01]);
        let drivers = shared_drivers(&link);

        let stages = upr_stages(
            vec![Step::WedgePress(WedgePressOp::Press {
                pos: 2.0,
                time_ms: 400,
            })],
            heaters_off(),
        );
        let (upr, task) = StageWorker::new("upr", sequencer(&drivers), stages)
            .with_safe_steps(heaters_off())
            .spawn();

        let report = upr.run().await.unwrap();
        assert_eq!(report.code, ReturnCode::SendError);
        assert_eq!(report.failed_stage, Some(0));
        assert_eq!(link.calls_to(roti_master::modules::heater::REQ_CODE), 2);

        drop(upr);
        task.await.unwrap();
    });
}

#[tokio::test]
async fn dropped_worker_reports_stopped() {
    let link = MockLink::dry_run();
    let drivers = shared_drivers(&link);
    let (dak, task) = dak_worker(&drivers).spawn();
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(matches!(dak.start().await, Err(MasterError::WorkerStopped)));
}
