//! Tracing setup and per-instrument log sinks.
//!
//! Every context gets an [`InstrumentLog`]. A line written to it is emitted as a
//! `tracing` event carrying an `instrument` field, and the same line is
//! rebroadcast on the bus `logs` signal so a host UI can show a per-instrument
//! log panel.

use crate::bus::{LogLine, Signal};
use chrono::Utc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides `default_level`.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// Per-instrument log sink.
#[derive(Clone, Debug)]
pub struct InstrumentLog {
    instrument: String,
    sink: Signal<LogLine>,
}

impl InstrumentLog {
    /// A sink tagging every line with `instrument`.
    pub fn new(instrument: impl Into<String>, sink: Signal<LogLine>) -> Self {
        Self {
            instrument: instrument.into(),
            sink,
        }
    }

    /// Instrument name.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Log at `DEBUG`.
    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::DEBUG, message.into());
    }

    /// Log at `INFO`.
    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::INFO, message.into());
    }

    /// Log at `WARN`.
    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::WARN, message.into());
    }

    /// Log at `ERROR`.
    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::ERROR, message.into());
    }

    fn log(&self, level: Level, message: String) {
        let instrument = self.instrument.as_str();
        // tracing needs the level at compile time.
        match level {
            Level::ERROR => tracing::error!(instrument, "{}", message),
            Level::WARN => tracing::warn!(instrument, "{}", message),
            Level::INFO => tracing::info!(instrument, "{}", message),
            Level::DEBUG => tracing::debug!(instrument, "{}", message),
            _ => tracing::trace!(instrument, "{}", message),
        }

        self.sink.publish(LogLine {
            instrument: self.instrument.clone(),
            level,
            message,
            timestamp: Utc::now(),
        });
    }
}
