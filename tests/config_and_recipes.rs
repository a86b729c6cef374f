//! The shipped configuration and recipe files, and how they feed the sequencer.

use roti_master::config::MasterConfig;
use roti_master::modules::{kneader, Drivers, ReturnCode};
use roti_master::sequencer::{KneaderOp, ModuleTag, Recipe, Step, StepSequencer};
use roti_master::transport::{MockLink, Transport};
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn repo_file(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

#[test]
#[serial]
fn shipped_config_matches_defaults() {
    let config = MasterConfig::load_from(repo_file("config/roti_master.toml")).unwrap();
    let defaults = MasterConfig::default();

    assert_eq!(config.transport.port, defaults.transport.port);
    assert_eq!(config.transport.resends, 3);
    assert_eq!(config.timing, defaults.timing);
    assert_eq!(config.sequencer.vt_top_limit, 47.0);
    assert!(config.gate.disabled.is_empty());
}

#[test]
fn shipped_recipe_parses() {
    let recipe = Recipe::from_toml_file(repo_file("recipes/dak.toml")).unwrap();
    assert_eq!(recipe.name, "dak");
    assert_eq!(recipe.steps.len(), 10);
    assert_eq!(recipe.steps[9], Step::Kneader(KneaderOp::Wait));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn configured_gate_and_sleep_switch_apply() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[sequencer]
sleep_enabled = false

[gate]
disabled = ["vt", "ds"]
"#
    )
    .unwrap();
    let config = MasterConfig::load_from(file.path()).unwrap();

    let link = MockLink::dry_run();
    let drivers = Arc::new(Drivers::with_timing(
        Arc::new(Transport::new(link.clone())),
        &config.timing,
    ));
    let mut sequencer = StepSequencer::from_config(drivers, &config);
    assert!(!sequencer.gate().is_available(ModuleTag::VerticalTray));
    assert!(!sequencer.gate().sleep_enabled());

    let recipe = Recipe::from_toml_file(repo_file("recipes/dak.toml")).unwrap();
    let (code, elapsed) = sequencer.execute(&recipe.steps).await.unwrap();

    assert_eq!(code, ReturnCode::NoError);
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(link.calls_to(kneader::REQ_CODE), 4);
    assert_eq!(link.call_count(), 4);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[transport]\nresends = 2").unwrap();

    std::env::set_var("ROTI_TRANSPORT__RESENDS", "5");
    let config = MasterConfig::load_from(file.path());
    std::env::remove_var("ROTI_TRANSPORT__RESENDS");

    assert_eq!(config.unwrap().transport.resends, 5);
}
