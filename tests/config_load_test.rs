//! Loading a bench from files on disk with the built-in drivers.

use inst_supervisor::config::SupervisorConfig;
use inst_supervisor::drivers::builtin_catalog;
use inst_supervisor::drivers::counter::COUNT_CHANNEL;
use inst_supervisor::{InstrumentError, LifecycleState, ShutdownTarget, Supervisor};
use serde_json::json;
use std::fs;
use std::path::Path;

fn write_instrument(root: &Path, name: &str, body: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("instrument.toml"), body).unwrap();
}

fn write_bench(root: &Path) -> SupervisorConfig {
    let instruments = root.join("instruments");
    let data = root.join("data");
    fs::write(
        root.join("supervisor.toml"),
        format!(
            r#"
[application]
name = "Test bench"
log_level = "debug"
data_dir = "{data}"

[supervisor]
instrument_dir = "{instruments}"
operation_timeout_ms = 1000

[[instruments]]
name = "counter"

[[instruments]]
name = "esp300"

[[instruments]]
name = "spare"
enabled = false
"#,
            data = data.display(),
            instruments = instruments.display(),
        ),
    )
    .unwrap();

    write_instrument(
        &instruments,
        "counter",
        r#"
[InstrumentInfo]
Name = "Photon Counter"
Model = "SimulatedCounter"

[Trigger]
Source = ["Camera1", "Manual"]

[Counter]
Start = 10
"#,
    );
    write_instrument(
        &instruments,
        "esp300",
        r#"
[InstrumentInfo]
Name = "Stage"
Model = "Esp300"
"#,
    );

    SupervisorConfig::load_from(root.join("supervisor.toml")).unwrap()
}

#[tokio::test]
async fn test_bench_loads_from_disk() {
    let root = tempfile::tempdir().unwrap();
    let config = write_bench(root.path());
    assert_eq!(config.enabled_instruments().len(), 2);
    assert_eq!(config.supervisor.operation_timeout_ms, Some(1000));

    let catalog = builtin_catalog(config.instruments.iter().map(|e| e.name.as_str()));
    let mut sup = Supervisor::from_config(&config, catalog);
    let report = sup.load_all(&config.instruments, &config.application.data_dir);

    assert_eq!(report.summary(), "1/3 instruments active.");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "esp300");
    assert!(matches!(
        &report.failed[0].error,
        InstrumentError::DriverResolution(msg) if msg.contains("Esp300")
    ));

    sup.flush_all().await.unwrap();
    let counter = sup.context("counter").unwrap();
    assert_eq!(counter.data_path(), config.application.data_dir.join("Photon_Counter"));
    let mut counts = counter.channels().get(COUNT_CHANNEL).unwrap().subscribe();

    sup.dispatch_trigger("Camera1");
    sup.dispatch_trigger("Manual");
    sup.dispatch_trigger("Timed");
    sup.flush_all().await.unwrap();

    let values: Vec<_> = counts.drain().into_iter().map(|e| e.payload).collect();
    assert_eq!(values, vec![json!(10), json!(11)]);
    assert_eq!(sup.snapshot("counter").unwrap().state, LifecycleState::Ready);

    sup.shutdown(ShutdownTarget::All).await.unwrap();
}

#[test]
fn test_missing_application_section_is_a_load_error() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("supervisor.toml");
    fs::write(&path, "[[instruments]]\nname = \"a\"\n").unwrap();
    assert!(SupervisorConfig::load_from(&path).is_err());
}
