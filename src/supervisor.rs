//! Supervisor: loads the configured instruments and routes host requests to them.
//!
//! The supervisor never runs driver code itself. It builds contexts, starts their
//! workers, and from then on only submits jobs: a dispatched trigger becomes one
//! job per subscribed context, a reset or shutdown one job for the named context.
//! A failing instrument is recorded in the [`LoadReport`] and on the bus; it never
//! stops the others from loading.

use crate::bus::{ErrorEvent, InstrumentAdded, SignalBus};
use crate::config::{
    ConfigSource, DirectoryConfigSource, InstrumentEntry, SupervisorConfig, SupervisorSettings,
};
use crate::context::{ContextSettings, InstrumentContext, InstrumentSnapshot};
use crate::driver::DriverCatalog;
use crate::error::{InstrumentError, SupervisorError, SupervisorResult};
use crate::lifecycle::LifecycleState;
use crate::trigger::TriggerRouter;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Progress message published when `load_all` starts.
pub const PROGRESS_LOADING: &str = "Loading Instruments...";

/// An enabled instrument that could not be brought up.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadFailure {
    /// Entry name.
    pub name: String,
    /// Why it failed.
    pub error: InstrumentError,
}

/// Outcome of [`Supervisor::load_all`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoadReport {
    /// Loaded and started, in load order.
    pub active: Vec<String>,
    /// Enabled entries that failed, with the cause.
    pub failed: Vec<LoadFailure>,
    /// Entries skipped because `enabled = false`.
    pub disabled: Vec<String>,
    /// Every entry passed in, enabled or not.
    pub total: usize,
}

impl LoadReport {
    /// Number of instruments loaded and started.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// `"<active>/<total> instruments active."`
    pub fn summary(&self) -> String {
        format!("{}/{} instruments active.", self.active.len(), self.total)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Which instruments `shutdown` closes.
pub enum ShutdownTarget {
    /// The named instrument only.
    Instrument(String),
    /// Every active instrument, concurrently.
    All,
}

/// Owns the active instrument contexts and routes host requests to them.
pub struct Supervisor {
    bus: SignalBus,
    catalog: DriverCatalog,
    configs: Arc<dyn ConfigSource>,
    settings: SupervisorSettings,
    contexts: HashMap<String, InstrumentContext>,
    by_index: BTreeMap<usize, String>,
    router: TriggerRouter,
    next_index: usize,
}

impl Supervisor {
    /// A supervisor with no instruments loaded yet.
    pub fn new(
        settings: SupervisorSettings,
        catalog: DriverCatalog,
        configs: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            bus: SignalBus::new(),
            catalog,
            configs,
            settings,
            contexts: HashMap::new(),
            by_index: BTreeMap::new(),
            router: TriggerRouter::new(),
            next_index: 0,
        }
    }

    /// Instrument configs are read from `supervisor.instrument_dir`.
    pub fn from_config(config: &SupervisorConfig, catalog: DriverCatalog) -> Self {
        let configs = Arc::new(DirectoryConfigSource::new(&config.supervisor.instrument_dir));
        Self::new(config.supervisor.clone(), catalog, configs)
    }

    /// The shared signal bus.
    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Settings every context was created with.
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Load, construct and start every enabled entry, in order. Each enabled entry
    /// takes the next index, whether or not it loads.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime. See [`InstrumentContext::start`].
    pub fn load_all(&mut self, entries: &[InstrumentEntry], global_path: &Path) -> LoadReport {
        self.bus.progress.publish(PROGRESS_LOADING.to_string());
        info!(count = entries.len(), data_dir = %global_path.display(), "Loading instruments");

        let mut report = LoadReport {
            total: entries.len(),
            ..LoadReport::default()
        };

        for entry in entries {
            if !entry.enabled {
                debug!(instrument = %entry.name, "Skipping disabled instrument");
                report.disabled.push(entry.name.clone());
                continue;
            }

            let index = self.next_index;
            self.next_index += 1;

            match self.load_one(&entry.name, index, global_path) {
                Ok(mut context) => {
                    self.router.register(index, &context.trigger_params().sources);
                    self.bus.added.publish(InstrumentAdded {
                        index,
                        name: entry.name.clone(),
                        data_path: context.data_path().to_path_buf(),
                        config: context.config().clone(),
                    });
                    context.start();
                    info!(instrument = %entry.name, index, "Instrument started");

                    self.by_index.insert(index, entry.name.clone());
                    self.contexts.insert(entry.name.clone(), context);
                    report.active.push(entry.name.clone());
                }
                Err(err) => {
                    error!(instrument = %entry.name, index, error = %err, "Failed to load instrument");
                    self.bus.errors.publish(ErrorEvent {
                        index,
                        name: entry.name.clone(),
                        error: err.clone(),
                        timestamp: Utc::now(),
                    });
                    report.failed.push(LoadFailure {
                        name: entry.name.clone(),
                        error: err,
                    });
                }
            }
        }

        let summary = report.summary();
        info!("{}", summary);
        self.bus.progress.publish(summary);
        report
    }

    fn load_one(
        &self,
        name: &str,
        index: usize,
        global_path: &Path,
    ) -> Result<InstrumentContext, InstrumentError> {
        if self.contexts.contains_key(name) {
            return Err(InstrumentError::Config(format!(
                "instrument '{}' is already loaded",
                name
            )));
        }
        let entry = self.catalog.resolve(name)?;
        let config = self.configs.load(name)?;
        InstrumentContext::load(
            name,
            index,
            config,
            entry,
            global_path,
            self.bus.clone(),
            ContextSettings::from(&self.settings),
        )
    }

    /// Submit `trigger(tag)` to every subscribed context. Never waits. Returns the
    /// number of contexts the trigger was submitted to.
    pub fn dispatch_trigger(&self, tag: &str) -> usize {
        let mut submitted = 0;
        for index in self.router.route(tag) {
            let Some(context) = self.by_index.get(&index).and_then(|n| self.contexts.get(n))
            else {
                continue;
            };
            if context.trigger(tag) {
                submitted += 1;
            } else {
                warn!(instrument = %context.name(), tag, "Worker gone, trigger not submitted");
            }
        }
        debug!(tag, submitted, "Trigger dispatched");
        submitted
    }

    /// Reset one instrument and wait for it to settle in `Ready` or `Error`.
    pub async fn reset(&self, name: &str) -> SupervisorResult<LifecycleState> {
        let done = self.context(name)?.request_reset()?;
        info!(instrument = %name, "Reset requested");
        done.await
            .map_err(|_| SupervisorError::WorkerStopped(name.to_string()))
    }

    /// Close and remove one instrument, or all of them.
    pub async fn shutdown(&mut self, target: ShutdownTarget) -> SupervisorResult<()> {
        let wait = Duration::from_millis(self.settings.shutdown_timeout_ms);
        match target {
            ShutdownTarget::Instrument(name) => {
                let context = self.remove(&name)?;
                let state = context.shutdown(wait).await?;
                info!(instrument = %name, %state, "Instrument shut down");
                Ok(())
            }
            ShutdownTarget::All => {
                let names: Vec<String> = self.by_index.values().cloned().collect();
                info!(count = names.len(), "Shutting down all instruments");
                let mut contexts = Vec::with_capacity(names.len());
                for name in &names {
                    contexts.push(self.remove(name)?);
                }

                let results = join_all(contexts.into_iter().map(|c| c.shutdown(wait))).await;
                let errors: Vec<SupervisorError> =
                    results.into_iter().filter_map(Result::err).collect();
                if errors.is_empty() {
                    info!("All instruments shut down");
                    Ok(())
                } else {
                    for err in &errors {
                        error!(error = %err, "Shutdown error");
                    }
                    Err(SupervisorError::ShutdownFailed(errors))
                }
            }
        }
    }

    fn remove(&mut self, name: &str) -> SupervisorResult<InstrumentContext> {
        let context = self
            .contexts
            .remove(name)
            .ok_or_else(|| SupervisorError::UnknownInstrument(name.to_string()))?;
        self.router.unregister(context.index());
        self.by_index.remove(&context.index());
        Ok(context)
    }

    /// Arm the timer of `name`. See [`InstrumentContext::start_timer`].
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime.
    pub fn start_timer(&mut self, name: &str, interval: Option<Duration>) -> SupervisorResult<Duration> {
        self.context_mut(name)?.start_timer(interval)
    }

    /// Disarm the timer of `name`. Idempotent.
    pub fn stop_timer(&mut self, name: &str) -> SupervisorResult<()> {
        self.context_mut(name)?.stop_timer();
        Ok(())
    }

    /// Arm the timer of every instrument with a `Timed` source. Returns their names.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime.
    pub fn start_timers(&mut self) -> Vec<String> {
        let mut armed = Vec::new();
        for context in self.contexts.values_mut() {
            if context.trigger_params().sources.is_timed() && context.start_timer(None).is_ok() {
                armed.push(context.name().to_string());
            }
        }
        armed.sort();
        armed
    }

    /// Run a per-instrument UI action. See [`InstrumentContext::ui_action`].
    ///
    /// # Panics
    ///
    /// Same as [`InstrumentContext::ui_action`].
    pub fn ui_action(&mut self, name: &str, action: &str) -> SupervisorResult<()> {
        self.context_mut(name)?.ui_action(action);
        Ok(())
    }

    /// The last snapshot of `name`.
    pub fn snapshot(&self, name: &str) -> SupervisorResult<InstrumentSnapshot> {
        Ok(self.context(name)?.snapshot())
    }

    /// Snapshots of every active instrument, by index.
    pub fn snapshots(&self) -> Vec<InstrumentSnapshot> {
        self.by_index
            .values()
            .filter_map(|name| self.contexts.get(name))
            .map(InstrumentContext::snapshot)
            .collect()
    }

    /// Wait until every job submitted so far, on every instrument, has run.
    pub async fn flush_all(&self) -> SupervisorResult<()> {
        let mut pending = Vec::with_capacity(self.contexts.len());
        for context in self.contexts.values() {
            pending.push((context.name().to_string(), context.request_flush()?));
        }
        for (name, done) in pending {
            done.await
                .map_err(|_| SupervisorError::WorkerStopped(name))?;
        }
        Ok(())
    }

    /// The context of an active instrument.
    pub fn context(&self, name: &str) -> SupervisorResult<&InstrumentContext> {
        self.contexts
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownInstrument(name.to_string()))
    }

    fn context_mut(&mut self, name: &str) -> SupervisorResult<&mut InstrumentContext> {
        self.contexts
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownInstrument(name.to_string()))
    }

    /// Active instrument names, by index.
    pub fn names(&self) -> Vec<&str> {
        self.by_index.values().map(String::as_str).collect()
    }

    /// Number of active instruments.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no instrument is active.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
