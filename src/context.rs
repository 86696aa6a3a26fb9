//! Instrument context: one instrument, its driver, and the worker that drives it.
//!
//! ```text
//! InstrumentContext (handle, owned by the supervisor)
//!   |  jobs: Init | Trigger | Reset | Close | Flush   (unbounded mpsc, FIFO)
//!   v
//! ContextWorker (tokio task)
//!   - owns the lifecycle state, the driver, and its channels
//!   - runs one job at a time, in submission order
//!   - publishes status / error / ready / acquisition events on the bus
//!   - mirrors its state into a watch channel read by `snapshot()`
//! ```
//!
//! The handle never touches the driver. Every driver call happens on the worker,
//! guarded against panics and (optionally) against hanging past
//! `operation_timeout_ms`.

use crate::bus::{
    AcquisitionEvent, ChannelSet, ErrorEvent, ReadyEvent, SignalBus, StatusEvent,
};
use crate::config::{resolve_data_dir, InstrumentConfig, SupervisorSettings};
use crate::driver::{wire_ui_bindings, Driver, DriverEntry, DriverIo};
use crate::error::{InstrumentError, SupervisorError, SupervisorResult};
use crate::lifecycle::{transition, Effect, LifecycleEvent, LifecycleState, Transition};
use crate::logging::InstrumentLog;
use crate::trigger::{IntervalTimer, TriggerParams, TriggerSources, MANUAL, TIMED};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument as _};

/// Per-context runtime settings, derived from [`SupervisorSettings`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextSettings {
    /// Upper bound for one driver call.
    pub operation_timeout: Option<Duration>,
    /// Timer period used when `Trigger.Interval` is missing or invalid.
    pub default_interval: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

impl From<&SupervisorSettings> for ContextSettings {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            operation_timeout: settings.operation_timeout_ms.map(Duration::from_millis),
            default_interval: Duration::from_millis(settings.default_interval_ms),
        }
    }
}

/// Point-in-time view of a context, as last published by its worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstrumentSnapshot {
    /// Instrument name.
    pub name: String,
    /// Context index.
    pub index: usize,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// `state == Ready`.
    pub ready: bool,
    /// Last published status text.
    pub status: String,
    /// Set by the last failure, cleared on reaching `Ready`.
    pub error: Option<InstrumentError>,
    /// Accepted triggers since load. Survives resets.
    pub acquisitions: u64,
    /// Subscribed trigger sources.
    pub sources: TriggerSources,
}

enum Job {
    Init,
    Trigger {
        source: String,
        /// A reset was submitted and had not completed when this trigger was.
        during_reset: bool,
    },
    Reset(oneshot::Sender<LifecycleState>),
    Close(oneshot::Sender<LifecycleState>),
    Flush(oneshot::Sender<()>),
}

/// Host-side handle of one instrument.
pub struct InstrumentContext {
    name: String,
    index: usize,
    config: Arc<InstrumentConfig>,
    data_path: PathBuf,
    params: TriggerParams,
    settings: ContextSettings,
    log: InstrumentLog,
    jobs: mpsc::UnboundedSender<Job>,
    snapshot: watch::Receiver<InstrumentSnapshot>,
    channels: watch::Receiver<ChannelSet>,
    reset_pending: Arc<AtomicUsize>,
    timer: IntervalTimer,
    worker: Option<ContextWorker>,
    task: Option<JoinHandle<()>>,
}

impl InstrumentContext {
    /// Parse the configuration, create the data directory, read the trigger
    /// parameters, and build and wire the driver. Does not initialize the driver;
    /// that is the first job once [`InstrumentContext::start`] runs.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        name: &str,
        index: usize,
        mut config: InstrumentConfig,
        entry: DriverEntry,
        global_path: &Path,
        bus: SignalBus,
        settings: ContextSettings,
    ) -> Result<Self, InstrumentError> {
        let log = InstrumentLog::new(name, bus.logs.clone());

        let display_name = config.instrument_name()?.to_string();
        log.info(format!(
            "Loading {} ({})",
            display_name,
            config.model().unwrap_or("unknown model")
        ));

        let data_path = resolve_data_dir(&mut config, global_path)?;
        log.info(format!("Saving data to {}", data_path.display()));

        let params = TriggerParams::from_config(&config, settings.default_interval, &log);
        let config = Arc::new(config);

        let mut driver = build_driver(&entry, &config).map_err(InstrumentError::DriverResolution)?;
        let (channels, ui_channels) = attach_driver(driver.as_mut(), name, &config, &entry, &log);

        let initial = InstrumentSnapshot {
            name: name.to_string(),
            index,
            state: LifecycleState::Uninitialized,
            ready: false,
            status: LifecycleState::Uninitialized.to_string(),
            error: None,
            acquisitions: 0,
            sources: params.sources.clone(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (channels_tx, channels_rx) = watch::channel(channels.clone());
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        // Queued ahead of anything a host can submit.
        let _ = jobs_tx.send(Job::Init);

        let reset_pending = Arc::new(AtomicUsize::new(0));
        let worker = ContextWorker {
            name: name.to_string(),
            index,
            state: LifecycleState::Uninitialized,
            status: LifecycleState::Uninitialized.to_string(),
            error: None,
            acquisitions: 0,
            config: Arc::clone(&config),
            entry,
            params: params.clone(),
            driver: Some(driver),
            channels,
            ui_channels,
            bus,
            log: log.clone(),
            operation_timeout: settings.operation_timeout,
            snapshot: snapshot_tx,
            channels_tx,
            reset_pending: Arc::clone(&reset_pending),
            jobs: jobs_rx,
        };

        Ok(Self {
            name: name.to_string(),
            index,
            config,
            data_path,
            params,
            settings,
            log,
            jobs: jobs_tx,
            snapshot: snapshot_rx,
            channels: channels_rx,
            reset_pending,
            timer: IntervalTimer::new(),
            worker: Some(worker),
            task: None,
        })
    }

    /// Spawn the worker. Its first job initializes the driver. A second call is a
    /// no-op.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime: the worker is spawned with `tokio::spawn`.
    pub fn start(&mut self) {
        let Some(worker) = self.worker.take() else {
            debug!(instrument = %self.name, "Worker already started");
            return;
        };
        let span = tracing::info_span!("instrument", name = %self.name, index = self.index);
        self.task = Some(tokio::spawn(worker.run().instrument(span)));
    }

    /// Whether `start` has spawned the worker.
    pub fn is_started(&self) -> bool {
        self.task.is_some()
    }

    /// Instrument name, as given to `load`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index assigned at load.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Configuration including the resolved data path.
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Directory this instrument writes its data to.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Parsed `[Trigger]` section.
    pub fn trigger_params(&self) -> &TriggerParams {
        &self.params
    }

    /// Log sink for this instrument.
    pub fn log(&self) -> &InstrumentLog {
        &self.log
    }

    /// Submit a trigger job. Never waits; returns `false` only if the worker is
    /// gone. Whether the trigger is accepted is decided when the job runs.
    pub fn trigger(&self, source: &str) -> bool {
        submit_trigger(&self.jobs, &self.reset_pending, source)
    }

    /// Submit a reset job without waiting for it. The receiver resolves with the
    /// state the reset ended in.
    pub fn request_reset(&self) -> SupervisorResult<oneshot::Receiver<LifecycleState>> {
        let (done, result) = oneshot::channel();
        self.reset_pending.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(Job::Reset(done)).is_err() {
            self.reset_pending.fetch_sub(1, Ordering::SeqCst);
            return Err(self.stopped());
        }
        Ok(result)
    }

    /// Tear down and rebuild the driver, then re-initialize. Resolves with the
    /// state the reset ended in (`Ready` or `Error`).
    pub async fn reset(&self) -> SupervisorResult<LifecycleState> {
        let result = self.request_reset()?;
        result.await.map_err(|_| self.stopped())
    }

    /// Close the driver. The context ends in `Shutdown` whatever the outcome.
    pub async fn close(&mut self) -> SupervisorResult<LifecycleState> {
        self.timer.stop();
        if let Some(worker) = self.worker.as_mut() {
            // Never started: close inline, there is no queue consumer.
            worker.run_close().await;
            return Ok(worker.state);
        }
        let (done, result) = oneshot::channel();
        self.jobs
            .send(Job::Close(done))
            .map_err(|_| self.stopped())?;
        result.await.map_err(|_| self.stopped())
    }

    /// Submit a barrier job. The receiver resolves once every job submitted
    /// before it has run.
    pub fn request_flush(&self) -> SupervisorResult<oneshot::Receiver<()>> {
        let (done, result) = oneshot::channel();
        if self.worker.is_some() {
            // Nothing runs before `start`.
            let _ = done.send(());
        } else {
            self.jobs
                .send(Job::Flush(done))
                .map_err(|_| self.stopped())?;
        }
        Ok(result)
    }

    /// Resolve once every job submitted before this call has run.
    pub async fn flush(&self) -> SupervisorResult<()> {
        let result = self.request_flush()?;
        result.await.map_err(|_| self.stopped())
    }

    /// Arm the `Timed` trigger timer. `interval` overrides the configured period.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime, like [`IntervalTimer::start`].
    pub fn start_timer(&mut self, interval: Option<Duration>) -> SupervisorResult<Duration> {
        if !self.params.sources.is_timed() {
            return Err(SupervisorError::TimerUnavailable(self.name.clone()));
        }
        let period = interval
            .filter(|d| !d.is_zero())
            .or(self.params.interval)
            .unwrap_or(self.settings.default_interval);

        let jobs = self.jobs.clone();
        let pending = Arc::clone(&self.reset_pending);
        self.timer
            .start(period, move || submit_trigger(&jobs, &pending, TIMED));
        self.log
            .info(format!("Timer started ({} ms)", period.as_millis()));
        Ok(period)
    }

    /// Disarm the timer. Idempotent.
    pub fn stop_timer(&mut self) {
        if self.timer.is_armed() {
            self.log.info("Timer stopped");
        }
        self.timer.stop();
    }

    /// Whether the interval timer is running.
    pub fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// Per-instrument UI actions: `Start` / `Stop` the timer, or fire a `Manual`
    /// trigger. Anything else is logged and ignored.
    ///
    /// # Panics
    ///
    /// `Start` panics outside a Tokio runtime. See [`InstrumentContext::start_timer`].
    pub fn ui_action(&mut self, action: &str) {
        match action {
            "Start" => {
                if let Err(e) = self.start_timer(None) {
                    self.log.warn(e.to_string());
                }
            }
            "Stop" => self.stop_timer(),
            MANUAL => {
                self.trigger(MANUAL);
            }
            other => self.log.warn(format!("Unknown UI action '{}'", other)),
        }
    }

    /// The last snapshot published by the worker.
    pub fn snapshot(&self) -> InstrumentSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver notified on every published snapshot.
    pub fn watch(&self) -> watch::Receiver<InstrumentSnapshot> {
        self.snapshot.clone()
    }

    /// The data channels of the current driver. Replaced on every reset.
    pub fn channels(&self) -> ChannelSet {
        self.channels.borrow().clone()
    }

    /// Close the instrument and stop its worker. Waits up to `wait` for each step,
    /// then aborts the worker.
    pub async fn shutdown(mut self, wait: Duration) -> SupervisorResult<LifecycleState> {
        let timeout_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        let closed = tokio::time::timeout(wait, self.close()).await;
        let state = match closed {
            Ok(result) => result,
            Err(_) => {
                warn!(instrument = %self.name, ?wait, "Close did not finish in time, aborting worker");
                if let Some(task) = self.task.take() {
                    task.abort();
                }
                return Err(SupervisorError::ShutdownTimeout {
                    name: self.name.clone(),
                    timeout_ms,
                });
            }
        };

        let Self { name, jobs, task, .. } = self;
        drop(jobs);
        if let Some(task) = task {
            match tokio::time::timeout(wait, task).await {
                Ok(Ok(())) => debug!(instrument = %name, "Worker stopped"),
                Ok(Err(e)) => warn!(instrument = %name, error = %e, "Worker ended abnormally"),
                Err(_) => warn!(instrument = %name, ?wait, "Worker did not stop in time"),
            }
        }
        state
    }

    fn stopped(&self) -> SupervisorError {
        SupervisorError::WorkerStopped(self.name.clone())
    }
}

fn submit_trigger(jobs: &mpsc::UnboundedSender<Job>, reset_pending: &AtomicUsize, source: &str) -> bool {
    jobs.send(Job::Trigger {
        source: source.to_string(),
        during_reset: reset_pending.load(Ordering::SeqCst) > 0,
    })
    .is_ok()
}

/// Run the factory, turning a panic into an error message.
fn build_driver(entry: &DriverEntry, config: &InstrumentConfig) -> Result<Box<dyn Driver>, String> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| entry.build(config))) {
        Ok(Ok(driver)) => Ok(driver),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic_message(panic)),
    }
}

/// Create fresh data and UI channels for `driver` and hand them over.
fn attach_driver(
    driver: &mut dyn Driver,
    name: &str,
    config: &Arc<InstrumentConfig>,
    entry: &DriverEntry,
    log: &InstrumentLog,
) -> (ChannelSet, ChannelSet) {
    let channels = ChannelSet::from_names(driver.outputs());
    let (ui_channels, connected) = wire_ui_bindings(&driver.ui_outputs(), entry.ui(), log);
    debug!(
        instrument = name,
        outputs = channels.len(),
        ui_outputs = ui_channels.len(),
        connected,
        "Driver wired"
    );

    driver.attach(DriverIo {
        name: name.to_string(),
        config: Arc::clone(config),
        channels: channels.clone(),
        ui_channels: ui_channels.clone(),
        log: log.clone(),
    });
    (channels, ui_channels)
}

/// Await a driver call, converting panics and timeouts into error messages.
async fn guarded<F>(timeout: Option<Duration>, call: F) -> Result<(), String>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let call = AssertUnwindSafe(call).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(format!("timed out after {} ms", limit.as_millis())),
        },
        None => call.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("driver panicked: {}", detail)
}

struct ContextWorker {
    name: String,
    index: usize,
    state: LifecycleState,
    status: String,
    error: Option<InstrumentError>,
    acquisitions: u64,
    config: Arc<InstrumentConfig>,
    entry: DriverEntry,
    params: TriggerParams,
    driver: Option<Box<dyn Driver>>,
    channels: ChannelSet,
    ui_channels: ChannelSet,
    bus: SignalBus,
    log: InstrumentLog,
    operation_timeout: Option<Duration>,
    snapshot: watch::Sender<InstrumentSnapshot>,
    channels_tx: watch::Sender<ChannelSet>,
    reset_pending: Arc<AtomicUsize>,
    jobs: mpsc::UnboundedReceiver<Job>,
}

impl ContextWorker {
    async fn run(mut self) {
        debug!("Worker started");
        while let Some(job) = self.jobs.recv().await {
            match job {
                Job::Init => self.run_init().await,
                Job::Trigger {
                    source,
                    during_reset,
                } => self.run_trigger(&source, during_reset).await,
                Job::Reset(done) => {
                    self.run_reset().await;
                    self.reset_pending.fetch_sub(1, Ordering::SeqCst);
                    let _ = done.send(self.state);
                }
                Job::Close(done) => {
                    self.run_close().await;
                    let _ = done.send(self.state);
                }
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(state = %self.state, "Worker finished");
    }

    async fn run_init(&mut self) {
        if !self.apply(LifecycleEvent::Start) {
            return;
        }
        self.initialize_driver().await;
    }

    /// Run `ui_init` then `init` on the current driver; the state must be
    /// `Initializing`.
    async fn initialize_driver(&mut self) {
        let timeout = self.operation_timeout;
        let Some(driver) = self.driver.as_mut() else {
            self.apply(LifecycleEvent::InitFailed(InstrumentError::Init(
                "no driver".to_string(),
            )));
            return;
        };

        if let Err(msg) = guarded(timeout, driver.ui_init()).await {
            self.log.warn(format!("Additional UI init failed: {}", msg));
        }

        let result = match self.driver.as_mut() {
            Some(driver) => guarded(timeout, driver.init()).await,
            None => Err("no driver".to_string()),
        };
        match result {
            Ok(()) => {
                self.log.info("Initialized");
                self.apply(LifecycleEvent::InitSucceeded);
            }
            Err(msg) => {
                self.apply(LifecycleEvent::InitFailed(InstrumentError::Init(msg)));
            }
        }
    }

    async fn run_trigger(&mut self, source: &str, during_reset: bool) {
        if !self.params.sources.matches(source) {
            debug!(source, "Trigger source not subscribed");
            return;
        }
        if during_reset {
            self.log
                .info(format!("Trigger '{}' dropped, reset pending", source));
            return;
        }
        if !self.state.accepts_trigger() {
            self.log.info(format!(
                "Trigger '{}' ignored, instrument is {}",
                source, self.state
            ));
            return;
        }

        self.apply(LifecycleEvent::TriggerAccepted);
        self.acquisitions += 1;
        self.bus.acquisitions.publish(AcquisitionEvent {
            index: self.index,
            name: self.name.clone(),
            count: self.acquisitions,
        });
        self.publish_snapshot();

        let timeout = self.operation_timeout;
        let result = match self.driver.as_mut() {
            Some(driver) => guarded(timeout, driver.acquire()).await,
            None => Err("no driver".to_string()),
        };
        match result {
            Ok(()) => {
                self.apply(LifecycleEvent::AcquireSucceeded);
            }
            Err(msg) => {
                self.apply(LifecycleEvent::AcquireFailed(InstrumentError::Acquire(msg)));
            }
        }
    }

    async fn run_reset(&mut self) {
        if !self.apply(LifecycleEvent::ResetRequested) {
            return;
        }
        self.log.info("Resetting");
        let timeout = self.operation_timeout;

        // Old listeners must not hear from the old driver once the reset begins.
        self.channels.close_all();
        self.ui_channels.close_all();

        if let Some(mut old) = self.driver.take() {
            if let Err(msg) = guarded(timeout, old.close()).await {
                self.assign_error(InstrumentError::Reset(format!("close failed: {}", msg)));
            }
            if let Err(msg) = guarded(timeout, old.teardown()).await {
                self.log.warn(format!("Teardown failed: {}", msg));
            }
        }

        let mut driver = match build_driver(&self.entry, &self.config) {
            Ok(driver) => driver,
            Err(msg) => {
                self.apply(LifecycleEvent::InitFailed(InstrumentError::Reset(msg)));
                return;
            }
        };

        let (channels, ui_channels) =
            attach_driver(driver.as_mut(), &self.name, &self.config, &self.entry, &self.log);
        self.channels = channels;
        self.ui_channels = ui_channels;
        self.channels_tx.send_replace(self.channels.clone());
        self.driver = Some(driver);
        self.bus.interface_ready.publish(self.name.clone());

        self.initialize_driver().await;
    }

    async fn run_close(&mut self) {
        if self.state.is_terminal() {
            debug!("Already shut down");
            return;
        }
        let timeout = self.operation_timeout;

        let outcome = match self.driver.take() {
            Some(mut driver) => {
                let closed = guarded(timeout, driver.close()).await;
                if let Err(msg) = guarded(timeout, driver.teardown()).await {
                    self.log.warn(format!("Teardown failed: {}", msg));
                }
                closed
            }
            None => Ok(()),
        };
        self.channels.close_all();
        self.ui_channels.close_all();

        match outcome {
            Ok(()) => {
                self.apply(LifecycleEvent::CloseSucceeded);
                self.log.info("Closed");
            }
            Err(msg) => {
                self.apply(LifecycleEvent::CloseFailed(InstrumentError::Close(msg)));
            }
        }
    }

    /// Feed `event` to the state machine and apply the resulting effects.
    /// Returns `false` (and logs) if the event is not valid in the current state.
    fn apply(&mut self, event: LifecycleEvent) -> bool {
        match transition(self.state, event) {
            Ok(Transition { state, effects }) => {
                debug!(from = %self.state, to = %state, "Transition");
                self.state = state;
                for effect in effects {
                    match effect {
                        Effect::Status(status) => self.set_status(status),
                        Effect::Ready => {
                            self.error = None;
                            self.bus.ready.publish(ReadyEvent {
                                index: self.index,
                                name: self.name.clone(),
                            });
                        }
                        Effect::Error(error) => self.assign_error(error),
                    }
                }
                self.publish_snapshot();
                true
            }
            Err(illegal) => {
                self.log.warn(illegal.to_string());
                false
            }
        }
    }

    fn set_status(&mut self, status: String) {
        self.status = status.clone();
        self.bus.status.publish(StatusEvent {
            index: self.index,
            name: self.name.clone(),
            status,
            timestamp: Utc::now(),
        });
    }

    /// Record an error: publish it, force not-ready, and show its text as status.
    fn assign_error(&mut self, error: InstrumentError) {
        self.log.error(error.to_string());
        debug!(kind = error.kind(), "Instrument error recorded");
        self.error = Some(error.clone());
        self.bus.errors.publish(ErrorEvent {
            index: self.index,
            name: self.name.clone(),
            error: error.clone(),
            timestamp: Utc::now(),
        });
        self.set_status(error.to_string());
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(InstrumentSnapshot {
            name: self.name.clone(),
            index: self.index,
            state: self.state,
            ready: self.state == LifecycleState::Ready,
            status: self.status.clone(),
            error: self.error.clone(),
            acquisitions: self.acquisitions,
            sources: self.params.sources.clone(),
        });
    }
}
