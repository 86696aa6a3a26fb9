//! Configuration: the supervisor file and the per-instrument configs.
//!
//! # Supervisor configuration
//!
//! Loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `SUPERVISOR_` (nested keys split on `__`)
//! 2. A TOML file (default: `config/supervisor.toml`)
//!
//! ```toml
//! [application]
//! name = "Lab bench"
//! log_level = "info"
//! data_dir = "data"
//!
//! [supervisor]
//! instrument_dir = "instruments"
//! operation_timeout_ms = 30000
//!
//! [[instruments]]
//! name = "camera"
//! enabled = true
//! ```
//!
//! ```text
//! SUPERVISOR_APPLICATION__LOG_LEVEL=debug
//! SUPERVISOR_SUPERVISOR__SHUTDOWN_TIMEOUT_MS=2000
//! ```
//!
//! # Instrument configuration
//!
//! Each instrument has its own sectioned key/value configuration
//! ([`InstrumentConfig`]), read by a [`ConfigSource`]. The supervisor relies on
//! `InstrumentInfo.Name`, `InstrumentInfo.Model`, `Data.Destination` and
//! `Trigger.Source` / `Trigger.Interval`; every other section belongs to the driver.
//! Option names are case-insensitive, section names are not.

use crate::error::{InstrumentError, SupervisorError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Section holding `Name` and `Model`.
pub const SECTION_INFO: &str = "InstrumentInfo";
/// Section holding `Destination` and the resolved `absolutePath`.
pub const SECTION_DATA: &str = "Data";
/// Section holding `Source` and `Interval`.
pub const SECTION_TRIGGER: &str = "Trigger";

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Application identity, logging and data location.
    pub application: ApplicationConfig,
    #[serde(default)]
    /// Runtime settings shared by every context.
    pub supervisor: SupervisorSettings,
    /// Instruments in load order. Indices are assigned in this order.
    #[serde(default)]
    pub instruments: Vec<InstrumentEntry>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Display name, used in logs.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Global data location; instrument data directories resolve against it.
    pub data_dir: PathBuf,
}

/// Runtime settings for instrument contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Directory holding one `<name>/instrument.toml` per instrument.
    #[serde(default = "default_instrument_dir")]
    pub instrument_dir: PathBuf,
    /// Upper bound for a single driver call, 30 s unless configured. A hung
    /// `init` then still leaves the instrument in `Error` instead of
    /// `Initializing`. `None` waits forever and is only settable from code.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: Option<u64>,
    /// How long `shutdown` waits for a worker to finish before aborting it.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Interval used when a `Timed` instrument has no valid `Trigger.Interval`.
    #[serde(default = "default_interval")]
    pub default_interval_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            instrument_dir: default_instrument_dir(),
            operation_timeout_ms: default_operation_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            default_interval_ms: default_interval(),
        }
    }
}

/// One entry of the instrument-name → enabled mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentEntry {
    /// Key used to find the driver and the instrument configuration.
    pub name: String,
    #[serde(default = "default_enabled")]
    /// Disabled entries are skipped by `load_all` and take no index.
    pub enabled: bool,
}

impl InstrumentEntry {
    /// An entry for `name`.
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
        }
    }
}

fn default_instrument_dir() -> PathBuf {
    PathBuf::from("instruments")
}

fn default_operation_timeout() -> Option<u64> {
    Some(30_000)
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_interval() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

impl SupervisorConfig {
    /// Load from `config/supervisor.toml` and the environment.
    pub fn load() -> Result<Self, SupervisorError> {
        Self::load_from("config/supervisor.toml")
    }

    /// Load from a specific file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, SupervisorError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SUPERVISOR_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks log level, timeouts and instrument name uniqueness.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SupervisorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.supervisor.operation_timeout_ms == Some(0) {
            return Err(SupervisorError::Configuration(
                "operation_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        if self.supervisor.shutdown_timeout_ms == 0 {
            return Err(SupervisorError::Configuration(
                "shutdown_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.supervisor.default_interval_ms == 0 {
            return Err(SupervisorError::Configuration(
                "default_interval_ms must be > 0".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for entry in &self.instruments {
            if entry.name.trim().is_empty() {
                return Err(SupervisorError::Configuration(
                    "Instrument name cannot be empty".to_string(),
                ));
            }
            if !names.insert(&entry.name) {
                return Err(SupervisorError::Configuration(format!(
                    "Duplicate instrument name: '{}'",
                    entry.name
                )));
            }
        }

        Ok(())
    }

    /// Entries with `enabled = true`, in order.
    pub fn enabled_instruments(&self) -> Vec<&InstrumentEntry> {
        self.instruments.iter().filter(|e| e.enabled).collect()
    }
}

// =============================================================================
// Instrument configuration
// =============================================================================

/// Sectioned key/value configuration for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl InstrumentConfig {
    /// An empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, mostly for tests and in-memory sources.
    pub fn with(mut self, section: &str, option: &str, value: impl Into<String>) -> Self {
        self.set(section, option, value);
        self
    }

    /// Parse a TOML document: each top-level table is a section, each scalar in it
    /// an option. Arrays are joined with commas so `Source = ["A", "B"]` and
    /// `Source = "A, B"` mean the same thing.
    pub fn from_toml_str(text: &str) -> Result<Self, InstrumentError> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| InstrumentError::Config(e.message().to_string()))?;

        let mut config = Self::new();
        for (section, value) in table {
            let toml::Value::Table(options) = value else {
                return Err(InstrumentError::Config(format!(
                    "top-level key '{}' is not a section",
                    section
                )));
            };
            config.add_section(&section);
            for (option, value) in options {
                config.set(&section, &option, toml_scalar_to_string(&value));
            }
        }
        Ok(config)
    }

    /// Whether `section` exists.
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Option names are case-insensitive.
    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.get(section, option).is_some()
    }

    /// Create `section` if missing.
    pub fn add_section(&mut self, section: &str) {
        self.sections.entry(section.to_string()).or_default();
    }

    /// Raw option value.
    pub fn get(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|options| options.get(&option.to_ascii_lowercase()))
            .map(String::as_str)
    }

    /// Parse an option into `T`. `None` if absent, `Some(Err)` if unparseable.
    pub fn get_parsed<T: FromStr>(&self, section: &str, option: &str) -> Option<Result<T, T::Err>> {
        self.get(section, option).map(|raw| raw.trim().parse())
    }

    /// Set an option, creating the section if needed.
    pub fn set(&mut self, section: &str, option: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_ascii_lowercase(), value.into());
    }

    /// Section names, sorted.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// `InstrumentInfo.Name`, required for every instrument.
    pub fn instrument_name(&self) -> Result<&str, InstrumentError> {
        self.get(SECTION_INFO, "Name")
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| InstrumentError::Config("missing InstrumentInfo.Name".to_string()))
    }

    /// `InstrumentInfo.Model`, if set.
    pub fn model(&self) -> Option<&str> {
        self.get(SECTION_INFO, "Model")
    }

    /// `InstrumentInfo.Name` with spaces replaced, for paths and log targets.
    pub fn slug(&self) -> Result<String, InstrumentError> {
        Ok(self.instrument_name()?.trim().replace(' ', "_"))
    }

    /// The resolved data directory, once [`resolve_data_dir`] has run.
    pub fn absolute_path(&self) -> Option<PathBuf> {
        self.get(SECTION_DATA, "absolutePath").map(PathBuf::from)
    }

    /// Human-readable dump used by default UI panels.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (section, options) in &self.sections {
            out.push_str(&format!("[{}]\n", section));
            for (key, value) in options {
                out.push_str(&format!("    {}: {}\n", key, value));
            }
            out.push('\n');
        }
        out
    }
}

fn toml_scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(toml_scalar_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Supplies the configuration of an instrument by name.
pub trait ConfigSource: Send + Sync {
    /// Configuration for the instrument registered as `instrument`.
    fn load(&self, instrument: &str) -> Result<InstrumentConfig, InstrumentError>;
}

/// Reads `<root>/<instrument>/instrument.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryConfigSource {
    root: PathBuf,
}

impl DirectoryConfigSource {
    /// A source reading below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the configuration of `instrument` is read from.
    pub fn path_for(&self, instrument: &str) -> PathBuf {
        self.root.join(instrument).join("instrument.toml")
    }
}

impl ConfigSource for DirectoryConfigSource {
    fn load(&self, instrument: &str) -> Result<InstrumentConfig, InstrumentError> {
        let path = self.path_for(instrument);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            InstrumentError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        InstrumentConfig::from_toml_str(&text)
    }
}

/// Serves configurations held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigSource {
    configs: HashMap<String, InstrumentConfig>,
}

impl MemoryConfigSource {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the configuration of `instrument`.
    pub fn insert(&mut self, instrument: impl Into<String>, config: InstrumentConfig) {
        self.configs.insert(instrument.into(), config);
    }

    /// Builder form of [`MemoryConfigSource::insert`].
    pub fn with(mut self, instrument: impl Into<String>, config: InstrumentConfig) -> Self {
        self.insert(instrument, config);
        self
    }
}

impl ConfigSource for MemoryConfigSource {
    fn load(&self, instrument: &str) -> Result<InstrumentConfig, InstrumentError> {
        self.configs.get(instrument).cloned().ok_or_else(|| {
            InstrumentError::Config(format!("no configuration for '{}'", instrument))
        })
    }
}

// =============================================================================
// Data directory
// =============================================================================

/// Create `path` (and parents) if missing.
pub fn ensure_directory(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Resolve the instrument's data directory, create it, and record it as
/// `Data.absolutePath`.
///
/// - no `Data.Destination`: `<global>/<Name with spaces as underscores>`
/// - absolute `Data.Destination`: used as is
/// - relative `Data.Destination`: `<global>/<Destination>`
pub fn resolve_data_dir(
    config: &mut InstrumentConfig,
    global_path: &Path,
) -> Result<PathBuf, InstrumentError> {
    let path = match config.get(SECTION_DATA, "Destination") {
        None => global_path.join(config.slug()?),
        Some(dest) if Path::new(dest).is_absolute() => PathBuf::from(dest),
        Some(dest) => global_path.join(dest),
    };

    ensure_directory(&path).map_err(|e| {
        InstrumentError::Config(format!(
            "cannot create data directory {}: {}",
            path.display(),
            e
        ))
    })?;

    config.add_section(SECTION_DATA);
    config.set(SECTION_DATA, "absolutePath", path.to_string_lossy());
    Ok(path)
}
