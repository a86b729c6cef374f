//! End-to-end runs of the step sequencer against a scripted slave board.

use roti_master::modules::{
    dispenser, kneader, vertical_tray, wedge_press, Drivers, ReturnCode,
};
use roti_master::protocol::FrameBuilder;
use roti_master::sequencer::{
    parse_recipe, DispenserOp, KneaderOp, ModuleGate, ModuleTag, SequencerSettings, Step,
    StepSequencer, VerticalTrayOp, WedgePressOp,
};
use roti_master::transport::{MockLink, Transport};
use std::sync::Arc;
use std::time::Duration;

fn drivers(link: &MockLink) -> Arc<Drivers<MockLink>> {
    Arc::new(Drivers::new(Arc::new(Transport::new(link.clone()))))
}

fn sequencer(link: &MockLink, gate: ModuleGate) -> StepSequencer<MockLink> {
    StepSequencer::new(drivers(link), gate, SequencerSettings::default())
}

#[tokio::test]
async fn dispense_by_weight_wire_bytes() {
    let link = MockLink::new();
    link.push_response(vec![dispenser::REQ_CODE, dispenser::SUB_BY_WEIGHT, 0x00, 0x00]);

    let issued = drivers(&link)
        .dispenser
        .dispense_by_weight(dispenser::ID_FLOUR, 22.0, 5.0, true)
        .await
        .unwrap();

    assert!(issued.accepted());
    assert_eq!(issued.awaiting(), dispenser::STATE_DISPENSING);
    assert_eq!(
        link.call_log(),
        vec![vec![
            0x21, 0x05, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x05, 0x00, 0x01
        ]]
    );
}

#[tokio::test(start_paused = true)]
async fn failing_step_short_circuits_the_rest() {
    let link = MockLink::new();
    // 1: kneader run, non-blocking
    link.push_response(vec![kneader::REQ_CODE, kneader::SUB_RUN, 0x00]);
    // 3: tray move, then a status with the move error flag set
    link.push_response(vec![vertical_tray::REQ_CODE, vertical_tray::SUB_MOVE, 0x00]);
    link.push_response(
        FrameBuilder::new(vertical_tray::REQ_CODE, vertical_tray::SUB_GET_STATE)
            .u8(0)
            .u8(vertical_tray::STATE_IDLE)
            .u8(vertical_tray::FLAG_MOVE_ERR)
            .q16(12.0)
            .q16(0.4)
            .build(),
    );

    let steps = vec![
        Step::Kneader(KneaderOp::Run { speed: 13.0 }),
        Step::Sleep { ms: 250 },
        Step::VerticalTray(VerticalTrayOp::MoveBlock {
            pos: 20.0,
            speed: 10.0,
        }),
        Step::Kneader(KneaderOp::Stop),
        Step::WedgePress(WedgePressOp::Press {
            pos: 3.0,
            time_ms: 500,
        }),
    ];

    let (code, elapsed) = sequencer(&link, ModuleGate::new())
        .execute(&steps)
        .await
        .unwrap();

    assert_eq!(code, ReturnCode::ExecutionError);
    assert!(elapsed >= Duration::from_millis(250));
    assert_eq!(link.call_count(), 3);
    assert_eq!(link.calls_with(kneader::REQ_CODE, kneader::SUB_STOP), 0);
    assert_eq!(link.calls_to(wedge_press::REQ_CODE), 0);
}

#[tokio::test]
async fn disabled_module_is_a_no_op() {
    let link = MockLink::new();
    let mut gate = ModuleGate::new();
    gate.disable(ModuleTag::Kneader);

    let steps = [
        Step::Kneader(KneaderOp::Run { speed: 13.0 }),
        Step::Kneader(KneaderOp::Wait),
    ];
    let (code, elapsed) = sequencer(&link, gate).execute(&steps).await.unwrap();

    assert_eq!(code, ReturnCode::NoError);
    assert_eq!(elapsed, Duration::ZERO);
    assert_eq!(link.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn json_recipe_on_idle_board() {
    let link = MockLink::dry_run();
    let steps = parse_recipe(
        r#"[
            { "module": "ds", "cmd": ["weight", 0, 120.0, 40] },
            { "module": "ds", "cmd": ["time", 1, 3000, 25] },
            { "module": "vt", "cmd": ["move_topnonblock", 10, 20] },
            { "module": "kn", "cmd": ["run", 13] },
            { "module": "sleep", "cmd": [1000] },
            { "module": "vt", "cmd": ["wait"] },
            { "module": "kn", "cmd": ["stop"] },
            { "module": "kn", "cmd": ["wait"] },
            { "module": "wp", "cmd": [10, 5, 800] },
            { "module": "ht", "cmd": ["OFF", 0] },
            { "module": "fan", "cmd": [3] }
        ]"#,
    )
    .unwrap();

    let (code, elapsed) = sequencer(&link, ModuleGate::new())
        .execute(&steps)
        .await
        .unwrap();

    assert_eq!(code, ReturnCode::NoError);
    assert!(elapsed >= Duration::from_secs(1));
    assert_eq!(
        link.calls_with(dispenser::REQ_CODE, dispenser::SUB_GET_STATUS),
        2
    );
    assert_eq!(link.calls_with(wedge_press::REQ_CODE, wedge_press::SUB_MOVE), 1);
}

#[tokio::test]
async fn tare_does_not_wait() {
    let link = MockLink::dry_run();
    let steps = [Step::Dispenser(DispenserOp::Tare)];
    let (code, _) = sequencer(&link, ModuleGate::new())
        .execute(&steps)
        .await
        .unwrap();

    assert_eq!(code, ReturnCode::NoError);
    assert_eq!(link.call_count(), 1);
}
