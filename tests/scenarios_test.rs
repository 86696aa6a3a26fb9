//! End-to-end trigger routing and lifecycle scenarios over mock drivers.

mod common;

use common::{instrument_config, BenchBuilder};
use inst_supervisor::drivers::mock::{MockScript, Op, Outcome, DATA_CHANNEL};
use inst_supervisor::driver::{UiSlot, UiSurface};
use inst_supervisor::{InstrumentError, LifecycleState};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_test::traced_test;

#[tokio::test]
async fn test_dispatch_reaches_only_subscribed_instruments() {
    let camera = MockScript::new();
    let meter = MockScript::new();
    let bench = BenchBuilder::new()
        .instrument("camera", Some("Camera1,Manual"), &camera)
        .instrument("meter", Some("Manual"), &meter)
        .load();
    let sup = &bench.supervisor;
    let mut acquisitions = sup.bus().acquisitions.subscribe();
    let mut statuses = sup.bus().status.subscribe();
    sup.flush_all().await.unwrap();
    statuses.drain();

    assert_eq!(sup.dispatch_trigger("Camera1"), 1);
    sup.flush_all().await.unwrap();

    let snap = sup.snapshot("camera").unwrap();
    assert_eq!(snap.state, LifecycleState::Ready);
    assert_eq!(snap.acquisitions, 1);
    let seen: Vec<String> = statuses.drain().into_iter().map(|e| e.status).collect();
    assert_eq!(seen, vec!["Acquiring", "Ready"]);
    assert_eq!(meter.calls(Op::Acquire), 0);

    assert_eq!(sup.dispatch_trigger("Unrelated"), 0);
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("camera").unwrap().acquisitions, 1);
    assert!(statuses.drain().is_empty());

    assert_eq!(sup.dispatch_trigger("Manual"), 2);
    sup.flush_all().await.unwrap();
    assert_eq!(camera.calls(Op::Acquire), 2);
    assert_eq!(meter.calls(Op::Acquire), 1);

    let counts: Vec<(String, u64)> = acquisitions
        .drain()
        .into_iter()
        .map(|e| (e.name, e.count))
        .collect();
    assert_eq!(
        counts,
        vec![
            ("camera".to_string(), 1),
            ("camera".to_string(), 2),
            ("meter".to_string(), 1)
        ]
    );
}

#[tokio::test]
#[traced_test]
async fn test_init_failure_then_reset_recovers() {
    let script = MockScript::new();
    script.push(Op::Init, Outcome::Fail("busy".into()));
    let bench = BenchBuilder::new()
        .instrument("spectrometer", Some("Manual"), &script)
        .load();
    let sup = &bench.supervisor;
    let mut errors = sup.bus().errors.subscribe();
    let mut ready = sup.bus().ready.subscribe();
    sup.flush_all().await.unwrap();

    let snap = sup.snapshot("spectrometer").unwrap();
    assert_eq!(snap.state, LifecycleState::Error);
    assert_eq!(snap.status, "Init error: busy");
    assert!(!snap.ready);
    assert_eq!(
        errors.drain().into_iter().map(|e| e.error).collect::<Vec<_>>(),
        vec![InstrumentError::Init("busy".into())]
    );

    // Not ready: logged, not an error.
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();
    assert_eq!(script.calls(Op::Acquire), 0);
    assert_eq!(sup.snapshot("spectrometer").unwrap().acquisitions, 0);
    assert!(errors.drain().is_empty());
    assert!(logs_contain("Trigger 'Manual' ignored, instrument is Error"));

    let mut interface_ready = sup.bus().interface_ready.subscribe();
    assert_eq!(
        sup.reset("spectrometer").await.unwrap(),
        LifecycleState::Ready
    );
    let snap = sup.snapshot("spectrometer").unwrap();
    assert_eq!(snap.status, "Ready");
    assert_eq!(snap.error, None);
    assert_eq!(ready.drain().len(), 1);
    assert_eq!(interface_ready.drain(), vec!["spectrometer".to_string()]);
    assert_eq!(script.calls(Op::Build), 2);
    assert_eq!(script.calls(Op::Close), 1);
}

#[tokio::test]
async fn test_wildcard_instrument_sees_every_tag() {
    let script = MockScript::new();
    let bench = BenchBuilder::new()
        .instrument("logger", None, &script)
        .instrument("camera", Some("Camera1"), &MockScript::new())
        .load();
    let sup = &bench.supervisor;
    sup.flush_all().await.unwrap();

    for tag in ["Camera1", "Manual", "Timed", "never-configured"] {
        assert!(sup.dispatch_trigger(tag) >= 1);
        sup.flush_all().await.unwrap();
    }
    assert_eq!(sup.snapshot("logger").unwrap().acquisitions, 4);
    assert_eq!(sup.snapshot("camera").unwrap().acquisitions, 1);
}

#[tokio::test]
async fn test_counter_survives_error_and_reset() {
    let script = MockScript::new();
    script.push(Op::Acquire, Outcome::Succeed);
    script.push(Op::Acquire, Outcome::Fail("no frame".into()));
    let bench = BenchBuilder::new()
        .instrument("camera", Some("Manual"), &script)
        .load();
    let sup = &bench.supervisor;

    sup.dispatch_trigger("Manual");
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();
    let snap = sup.snapshot("camera").unwrap();
    assert_eq!(snap.state, LifecycleState::Error);
    assert_eq!(snap.status, "Trigger error: no frame");
    assert_eq!(snap.acquisitions, 2);

    // Error state drops this one.
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("camera").unwrap().acquisitions, 2);

    sup.reset("camera").await.unwrap();
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("camera").unwrap().acquisitions, 3);
}

#[tokio::test]
async fn test_old_channels_are_silent_after_reset() {
    let script = MockScript::new();
    let bench = BenchBuilder::new()
        .instrument("camera", Some("Manual"), &script)
        .load();
    let sup = &bench.supervisor;
    sup.flush_all().await.unwrap();

    let old = sup.context("camera").unwrap().channels();
    let mut old_data = old.get(DATA_CHANNEL).unwrap().subscribe();
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();

    sup.reset("camera").await.unwrap();
    let new = sup.context("camera").unwrap().channels();
    let mut new_data = new.get(DATA_CHANNEL).unwrap().subscribe();
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();

    // The old driver emitted "closing" during reset; nobody heard it.
    assert_eq!(old_data.recv().await.unwrap().payload, json!({ "acquisition": 1 }));
    assert_eq!(old_data.recv().await, None);
    assert!(old.get(DATA_CHANNEL).unwrap().is_closed());

    let emission = new_data.recv().await.unwrap();
    assert_eq!(emission.channel, DATA_CHANNEL);
    assert_eq!(emission.payload, json!({ "acquisition": 1 }));
}

#[tokio::test]
async fn test_reset_with_failing_factory_ends_in_error() {
    let script = MockScript::new();
    script.push(Op::Build, Outcome::Succeed);
    script.push(Op::Build, Outcome::Fail("port vanished".into()));
    let bench = BenchBuilder::new()
        .instrument("stage", Some("Manual"), &script)
        .load();
    let sup = &bench.supervisor;

    assert_eq!(sup.reset("stage").await.unwrap(), LifecycleState::Error);
    assert_eq!(
        sup.snapshot("stage").unwrap().error,
        Some(InstrumentError::Reset("port vanished".into()))
    );

    // A third build succeeds.
    assert_eq!(sup.reset("stage").await.unwrap(), LifecycleState::Ready);
}

#[tokio::test]
async fn test_load_failures_are_reported_and_isolated() {
    let good = MockScript::new();
    let blocker_dir = tempfile::tempdir().unwrap();
    let blocker = blocker_dir.path().join("blocker");
    std::fs::write(&blocker, b"file, not a directory").unwrap();

    let unwritable = instrument_config("Meter", Some("Manual")).with(
        "Data",
        "Destination",
        blocker.join("meter").to_string_lossy(),
    );
    let nameless = inst_supervisor::InstrumentConfig::new().with("Trigger", "Source", "Manual");

    let bench = BenchBuilder::new()
        .unknown("laser")
        .configured("meter", unwritable, &MockScript::new())
        .configured("nameless", nameless, &MockScript::new())
        .disabled("spare")
        .instrument("camera", Some("Manual"), &good)
        .load();
    let report = &bench.report;
    let sup = &bench.supervisor;

    assert_eq!(report.active, vec!["camera"]);
    assert_eq!(report.total, 5);
    assert_eq!(report.summary(), "1/5 instruments active.");
    assert!(report.active_count() <= report.total - report.disabled.len());

    let failures: Vec<(&str, &InstrumentError)> = report
        .failed
        .iter()
        .map(|f| (f.name.as_str(), &f.error))
        .collect();
    assert_eq!(failures.len(), 3);
    assert!(matches!(failures[0], ("laser", InstrumentError::DriverResolution(_))));
    assert!(matches!(failures[1], ("meter", InstrumentError::Config(_))));
    assert!(matches!(failures[2], ("nameless", InstrumentError::Config(_))));

    // Failed entries still consumed their index.
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("camera").unwrap().index, 3);
    assert_eq!(sup.snapshot("camera").unwrap().state, LifecycleState::Ready);
    assert_eq!(sup.dispatch_trigger("Manual"), 1);
}

#[tokio::test]
async fn test_data_directory_is_created_from_name() {
    let script = MockScript::new();
    let config = instrument_config("Power Meter", Some("Manual"));
    let bench = BenchBuilder::new().configured("meter", config, &script).load();
    let sup = &bench.supervisor;

    let context = sup.context("meter").unwrap();
    let expected = bench.data.path().join("Power_Meter");
    assert_eq!(context.data_path(), expected);
    assert!(expected.is_dir());
    assert_eq!(context.config().absolute_path(), Some(expected));
}

struct Panel {
    values: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl UiSurface for Panel {
    fn resolve(&self, target: &str, attribute: &str) -> Option<UiSlot> {
        (target == "progress" && attribute == "set_value").then(|| {
            let values = Arc::clone(&self.values);
            Arc::new(move |v: &serde_json::Value| values.lock().unwrap().push(v.clone())) as UiSlot
        })
    }
}

#[tokio::test]
#[traced_test]
async fn test_ui_bindings_survive_reset_and_bad_entries_only_warn() {
    let script = MockScript::new();
    script.set_ui_outputs(["progress.set_value", "label.set_text", "broken"]);
    let values = Arc::new(Mutex::new(Vec::new()));
    let entry = script.entry().with_ui(Arc::new(Panel {
        values: Arc::clone(&values),
    }));

    let bench = BenchBuilder::new()
        .with_entry("camera", instrument_config("Camera", Some("Manual")), entry)
        .load();
    let sup = &bench.supervisor;
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("camera").unwrap().state, LifecycleState::Ready);

    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();
    sup.reset("camera").await.unwrap();
    sup.dispatch_trigger("Manual");
    sup.flush_all().await.unwrap();

    // One value per acquisition, from the old driver and then the new one.
    assert_eq!(*values.lock().unwrap(), vec![json!(1), json!(1)]);
    assert!(logs_contain("Malformed UI output 'broken'"));
    assert!(logs_contain("Could not resolve UI output 'label.set_text'"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_settles_when_init_hangs_with_default_settings() {
    let script = MockScript::new();
    script.push(Op::Init, Outcome::Succeed);
    script.push(Op::Init, Outcome::Hang);
    let bench = BenchBuilder::new()
        .instrument("camera", Some("Manual"), &script)
        .load();
    let sup = &bench.supervisor;
    sup.flush_all().await.unwrap();
    assert_eq!(sup.snapshot("camera").unwrap().state, LifecycleState::Ready);

    let state = tokio::time::timeout(Duration::from_secs(3600), sup.reset("camera"))
        .await
        .expect("reset settles within the default operation timeout")
        .unwrap();
    assert_eq!(state, LifecycleState::Error);
    assert_eq!(
        sup.snapshot("camera").unwrap().error,
        Some(InstrumentError::Init("timed out after 30000 ms".into()))
    );

    // The worker is free again: a later reset recovers.
    assert_eq!(sup.reset("camera").await.unwrap(), LifecycleState::Ready);
}
