//! Timed trigger sources: interval parsing, start/stop and UI actions.

mod common;

use common::{instrument_config, BenchBuilder};
use inst_supervisor::config::SupervisorSettings;
use inst_supervisor::drivers::mock::{MockScript, Op};
use inst_supervisor::SupervisorError;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_timer_fires_timed_triggers_until_stopped() {
    let script = MockScript::new();
    let config = instrument_config("Scope", Some("Timed")).with("Trigger", "Interval", "100");
    let mut bench = BenchBuilder::new().configured("scope", config, &script).load();
    let sup = &mut bench.supervisor;
    sup.flush_all().await.unwrap();

    assert_eq!(
        sup.start_timer("scope", None).unwrap(),
        Duration::from_millis(100)
    );
    assert!(sup.context("scope").unwrap().timer_armed());

    tokio::time::sleep(Duration::from_millis(350)).await;
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("scope").unwrap().acquisitions, 3);

    sup.stop_timer("scope").unwrap();
    sup.stop_timer("scope").unwrap();
    assert!(!sup.context("scope").unwrap().timer_armed());

    tokio::time::sleep(Duration::from_millis(500)).await;
    sup.flush_all().await.unwrap();
    assert_eq!(script.calls(Op::Acquire), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_interval_falls_back_to_default() {
    let script = MockScript::new();
    let config = instrument_config("Scope", Some("Timed, Manual")).with("Trigger", "Interval", "soon");
    let settings = SupervisorSettings {
        default_interval_ms: 250,
        ..SupervisorSettings::default()
    };
    let mut bench = BenchBuilder::new()
        .settings(settings)
        .configured("scope", config, &script)
        .load();
    let sup = &mut bench.supervisor;

    assert_eq!(
        sup.context("scope").unwrap().trigger_params().interval,
        Some(Duration::from_millis(250))
    );
    assert_eq!(
        sup.start_timer("scope", Some(Duration::from_millis(40))).unwrap(),
        Duration::from_millis(40)
    );
    assert_eq!(sup.start_timers(), vec!["scope".to_string()]);
    assert_eq!(
        sup.context("scope").unwrap().trigger_params().sources.to_string(),
        "Manual,Timed"
    );
}

#[tokio::test]
async fn test_timer_needs_a_timed_source() {
    let script = MockScript::new();
    let mut bench = BenchBuilder::new()
        .instrument("camera", Some("Manual"), &script)
        .instrument("logger", None, &MockScript::new())
        .load();
    let sup = &mut bench.supervisor;

    assert!(matches!(
        sup.start_timer("camera", None),
        Err(SupervisorError::TimerUnavailable(name)) if name == "camera"
    ));
    // A wildcard hears "Timed" triggers but owns no timer.
    assert!(matches!(
        sup.start_timer("logger", None),
        Err(SupervisorError::TimerUnavailable(_))
    ));
    assert!(matches!(
        sup.start_timer("ghost", None),
        Err(SupervisorError::UnknownInstrument(_))
    ));
    assert!(sup.start_timers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ui_actions_drive_timer_and_manual_trigger() {
    let script = MockScript::new();
    let config = instrument_config("Scope", Some("Timed,Manual")).with("Trigger", "Interval", "1000");
    let mut bench = BenchBuilder::new().configured("scope", config, &script).load();
    let sup = &mut bench.supervisor;
    sup.flush_all().await.unwrap();

    sup.ui_action("scope", "Manual").unwrap();
    sup.flush_all().await.unwrap();
    assert_eq!(script.calls(Op::Acquire), 1);

    sup.ui_action("scope", "Start").unwrap();
    assert!(sup.context("scope").unwrap().timer_armed());
    tokio::time::sleep(Duration::from_millis(2500)).await;
    sup.ui_action("scope", "Stop").unwrap();
    sup.flush_all().await.unwrap();
    assert_eq!(script.calls(Op::Acquire), 3);
    assert!(!sup.context("scope").unwrap().timer_armed());

    sup.ui_action("scope", "Rewind").unwrap();
    assert!(sup.ui_action("ghost", "Start").is_err());
}
