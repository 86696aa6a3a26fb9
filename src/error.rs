//! Error types for the supervisor.
//!
//! Two layers of errors exist, and they never mix:
//!
//! - **`InstrumentError`**: recorded on a single instrument context and published on
//!   the signal bus. These are *data*, not control flow: an instrument that fails to
//!   initialize, acquire or close degrades to the `Error` state while every other
//!   instrument keeps running. The display strings keep the prefixes operators are
//!   used to (`"Init error: busy"`, `"Trigger error: ..."`).
//! - **`SupervisorError`**: returned from the host-facing API when the request
//!   itself cannot be honoured, e.g. an unknown instrument name, a timer request on
//!   an instrument without a `Timed` source, or a configuration file that does not
//!   parse.
//!
//! Drivers report failures as `anyhow::Error`; the context maps them into the
//! matching `InstrumentError` kind at the instrument boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the host-facing error type.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// A failure recorded against one instrument context.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentError {
    /// Bad or missing configuration, or an unusable data path.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The driver could not be resolved or constructed.
    #[error("Interface init error: {0}")]
    DriverResolution(String),

    #[error("Init error: {0}")]
    /// `init` failed, panicked or timed out.
    Init(String),

    #[error("Trigger error: {0}")]
    /// `acquire` failed during an accepted trigger.
    Acquire(String),

    #[error("Close error: {0}")]
    /// `close` failed. The instrument still shuts down.
    Close(String),

    #[error("Reset error: {0}")]
    /// The driver could not be closed or rebuilt during a reset.
    Reset(String),
}

impl InstrumentError {
    /// Short name of the error kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            InstrumentError::Config(_) => "config",
            InstrumentError::DriverResolution(_) => "driver_resolution",
            InstrumentError::Init(_) => "init",
            InstrumentError::Acquire(_) => "acquire",
            InstrumentError::Close(_) => "close",
            InstrumentError::Reset(_) => "reset",
        }
    }
}

/// Errors returned by the host-facing supervisor API.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration load error: {0}")]
    /// The supervisor configuration could not be read or parsed.
    ConfigLoad(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    /// The supervisor configuration failed validation.
    Configuration(String),

    #[error("I/O error: {0}")]
    /// A filesystem operation failed.
    Io(#[from] std::io::Error),

    #[error("Unknown instrument: '{0}'")]
    /// No active instrument has this name.
    UnknownInstrument(String),

    #[error("Instrument '{0}' has no 'Timed' trigger source")]
    /// A timer was requested for an instrument without an explicit `Timed` source.
    TimerUnavailable(String),

    #[error("Worker for instrument '{0}' is no longer running")]
    /// The worker of this instrument has exited.
    WorkerStopped(String),

    #[error("Instrument '{name}' did not stop within {timeout_ms} ms")]
    /// An instrument did not finish closing in time and its worker was aborted.
    ShutdownTimeout { name: String, timeout_ms: u64 },

    #[error("Shutdown failed with errors")]
    /// One or more instruments failed to shut down.
    ShutdownFailed(Vec<SupervisorError>),
}
