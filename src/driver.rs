//! Driver adapter: the boundary between a context and instrument-specific code.
//!
//! A driver is built by a factory from the instrument's configuration, receives
//! its I/O handles through [`Driver::attach`], and then only sees lifecycle calls
//! from its context worker, one at a time. Every call may fail; the context maps
//! the failure into the matching [`InstrumentError`](crate::error::InstrumentError)
//! kind.
//!
//! Drivers are looked up by instrument name in a [`DriverCatalog`]. A catalog
//! entry may carry a [`UiSurface`], against which the driver's dotted UI bindings
//! (`"progress.set_value"`) are resolved.

use crate::bus::{ChannelSet, Emission};
use crate::config::InstrumentConfig;
use crate::error::InstrumentError;
use crate::logging::InstrumentLog;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handles given to a driver after construction.
#[derive(Clone, Debug)]
pub struct DriverIo {
    /// Instrument name.
    pub name: String,
    /// Configuration the driver was built from.
    pub config: Arc<InstrumentConfig>,
    /// One channel per name returned by [`Driver::outputs`].
    pub channels: ChannelSet,
    /// One channel per binding returned by [`Driver::ui_outputs`].
    pub ui_channels: ChannelSet,
    /// Per-instrument log sink.
    pub log: InstrumentLog,
}

/// Instrument-specific code driven by an instrument context.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Names of the data channels this driver emits on.
    fn outputs(&self) -> Vec<String>;

    /// Dotted `target.attribute` UI bindings this driver emits on.
    fn ui_outputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Receive channels and the log sink. Called once, before `init`.
    fn attach(&mut self, io: DriverIo);

    /// Connect and prepare for acquisition.
    async fn init(&mut self) -> anyhow::Result<()>;

    /// Run one acquisition in response to an accepted trigger.
    async fn acquire(&mut self) -> anyhow::Result<()>;

    /// Release the instrument. The driver is discarded afterwards.
    async fn close(&mut self) -> anyhow::Result<()>;

    /// Release whatever `close` left behind. Runs after `close`, also when it failed.
    async fn teardown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Extra UI setup, run after the UI bindings are wired. Failures are logged only.
    async fn ui_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a driver from an instrument configuration.
pub type DriverFactory =
    Arc<dyn Fn(&InstrumentConfig) -> anyhow::Result<Box<dyn Driver>> + Send + Sync>;

/// A slot on a UI surface receiving emitted payloads.
pub type UiSlot = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// A host-provided UI that driver bindings are resolved against.
pub trait UiSurface: Send + Sync {
    /// Look up `attribute` on the UI element `target`.
    fn resolve(&self, target: &str, attribute: &str) -> Option<UiSlot>;
}

/// What the catalog knows about one instrument's driver.
#[derive(Clone)]
pub struct DriverEntry {
    factory: DriverFactory,
    ui: Option<Arc<dyn UiSurface>>,
}

impl DriverEntry {
    /// An entry without a UI surface.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&InstrumentConfig) -> anyhow::Result<Box<dyn Driver>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            ui: None,
        }
    }

    /// Resolve UI bindings against `surface`.
    pub fn with_ui(mut self, surface: Arc<dyn UiSurface>) -> Self {
        self.ui = Some(surface);
        self
    }

    /// The UI surface, if any.
    pub fn ui(&self) -> Option<&Arc<dyn UiSurface>> {
        self.ui.as_ref()
    }

    /// Run the factory.
    pub fn build(&self, config: &InstrumentConfig) -> anyhow::Result<Box<dyn Driver>> {
        (self.factory)(config)
    }
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry")
            .field("has_ui", &self.ui.is_some())
            .finish()
    }
}

/// Instrument name → driver entry.
#[derive(Clone, Debug, Default)]
pub struct DriverCatalog {
    entries: HashMap<String, DriverEntry>,
}

impl DriverCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the driver for `instrument`.
    pub fn register(&mut self, instrument: impl Into<String>, entry: DriverEntry) {
        self.entries.insert(instrument.into(), entry);
    }

    /// Whether a driver is registered for `instrument`.
    pub fn contains(&self, instrument: &str) -> bool {
        self.entries.contains_key(instrument)
    }

    /// The entry registered for `instrument`.
    pub fn resolve(&self, instrument: &str) -> Result<DriverEntry, InstrumentError> {
        self.entries.get(instrument).cloned().ok_or_else(|| {
            InstrumentError::DriverResolution(format!(
                "no driver registered for '{}'",
                instrument
            ))
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Split `"target.attribute"`. Both halves must be non-empty and there must be
/// exactly one dot.
pub fn parse_binding(binding: &str) -> Option<(&str, &str)> {
    let (target, attribute) = binding.split_once('.')?;
    if target.is_empty() || attribute.is_empty() || attribute.contains('.') {
        return None;
    }
    Some((target, attribute))
}

/// Create the UI channels for `bindings` and connect each to its slot on
/// `surface`. Malformed or unresolved bindings are logged and left unconnected.
/// Returns the channels and how many were connected.
pub fn wire_ui_bindings(
    bindings: &[String],
    surface: Option<&Arc<dyn UiSurface>>,
    log: &InstrumentLog,
) -> (ChannelSet, usize) {
    let channels = ChannelSet::from_names(bindings.iter().cloned());
    let Some(surface) = surface else {
        if !bindings.is_empty() {
            log.warn("No UI available, UI outputs are not connected");
        }
        return (channels, 0);
    };

    let mut connected = 0;
    for binding in bindings {
        let Some((target, attribute)) = parse_binding(binding) else {
            log.warn(format!("Malformed UI output '{}', expected 'target.attribute'", binding));
            continue;
        };
        let Some(slot) = surface.resolve(target, attribute) else {
            log.warn(format!("Could not resolve UI output '{}'", binding));
            continue;
        };
        if let Some(channel) = channels.get(binding) {
            channel.connect(move |emission: &Emission| slot(&emission.payload));
            connected += 1;
        }
    }
    (channels, connected)
}
