//! Shared bench setup for the integration tests.

#![allow(dead_code)]

use inst_supervisor::config::{
    InstrumentConfig, InstrumentEntry, MemoryConfigSource, SupervisorSettings,
};
use inst_supervisor::drivers::MockScript;
use inst_supervisor::{DriverCatalog, DriverEntry, LoadReport, Supervisor};
use std::sync::Arc;
use tempfile::TempDir;

pub fn instrument_config(name: &str, source: Option<&str>) -> InstrumentConfig {
    let mut config = InstrumentConfig::new()
        .with("InstrumentInfo", "Name", name)
        .with("InstrumentInfo", "Model", "Mock");
    if let Some(source) = source {
        config.set("Trigger", "Source", source);
    }
    config
}

/// Builds a supervisor over mock drivers and in-memory configs.
pub struct BenchBuilder {
    catalog: DriverCatalog,
    configs: MemoryConfigSource,
    entries: Vec<InstrumentEntry>,
    settings: SupervisorSettings,
}

impl BenchBuilder {
    pub fn new() -> Self {
        Self {
            catalog: DriverCatalog::new(),
            configs: MemoryConfigSource::new(),
            entries: Vec::new(),
            settings: SupervisorSettings::default(),
        }
    }

    pub fn settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// A mock-driven instrument with the given trigger sources.
    pub fn instrument(self, name: &str, source: Option<&str>, script: &MockScript) -> Self {
        self.configured(name, instrument_config(name, source), script)
    }

    pub fn configured(self, name: &str, config: InstrumentConfig, script: &MockScript) -> Self {
        self.with_entry(name, config, script.entry())
    }

    pub fn with_entry(mut self, name: &str, config: InstrumentConfig, entry: DriverEntry) -> Self {
        self.catalog.register(name, entry);
        self.configs.insert(name, config);
        self.entries.push(InstrumentEntry::new(name, true));
        self
    }

    /// An entry in the instrument list with no driver and no config.
    pub fn unknown(mut self, name: &str) -> Self {
        self.entries.push(InstrumentEntry::new(name, true));
        self
    }

    pub fn disabled(mut self, name: &str) -> Self {
        self.entries.push(InstrumentEntry::new(name, false));
        self
    }

    pub fn load(self) -> Bench {
        let data = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(self.settings, self.catalog, Arc::new(self.configs));
        let report = supervisor.load_all(&self.entries, data.path());
        Bench {
            supervisor,
            report,
            data,
        }
    }
}

pub struct Bench {
    pub supervisor: Supervisor,
    pub report: LoadReport,
    pub data: TempDir,
}
