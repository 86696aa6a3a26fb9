//! Simulated counter: emits an increasing count on every acquisition.
//!
//! ```toml
//! [InstrumentInfo]
//! Name = "Counter"
//! Model = "SimulatedCounter"
//!
//! [Counter]
//! Start = 100
//! Step = 5
//! ```

use crate::config::InstrumentConfig;
use crate::driver::{Driver, DriverIo};
use anyhow::{anyhow, Context};
use async_trait::async_trait;

/// Output channel carrying the count.
pub const COUNT_CHANNEL: &str = "count";
const SECTION: &str = "Counter";

/// Driver emitting `Start`, `Start + Step`, ... on [`COUNT_CHANNEL`].
pub struct SimulatedCounter {
    start: u64,
    step: u64,
    value: Option<u64>,
    io: Option<DriverIo>,
}

impl SimulatedCounter {
    /// A counter starting at `start`, advancing by `step`.
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            start,
            step,
            value: None,
            io: None,
        }
    }

    /// Read `Counter.Start` (default 0) and `Counter.Step` (default 1).
    pub fn from_config(config: &InstrumentConfig) -> anyhow::Result<Self> {
        let start = config
            .get_parsed::<u64>(SECTION, "Start")
            .transpose()
            .context("Counter.Start must be a non-negative integer")?
            .unwrap_or(0);
        let step = config
            .get_parsed::<u64>(SECTION, "Step")
            .transpose()
            .context("Counter.Step must be a non-negative integer")?
            .unwrap_or(1);
        if step == 0 {
            return Err(anyhow!("Counter.Step must be > 0"));
        }
        Ok(Self::new(start, step))
    }

    /// Last emitted value. `None` until the first acquisition after `init`.
    pub fn value(&self) -> Option<u64> {
        self.value
    }
}

#[async_trait]
impl Driver for SimulatedCounter {
    fn outputs(&self) -> Vec<String> {
        vec![COUNT_CHANNEL.to_string()]
    }

    fn attach(&mut self, io: DriverIo) {
        self.io = Some(io);
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        self.value = None;
        if let Some(io) = &self.io {
            io.log.debug(format!("Counter starting at {}", self.start));
        }
        Ok(())
    }

    async fn acquire(&mut self) -> anyhow::Result<()> {
        let next = match self.value {
            None => self.start,
            Some(value) => value
                .checked_add(self.step)
                .ok_or_else(|| anyhow!("counter overflow"))?,
        };
        self.value = Some(next);

        let io = self.io.as_ref().context("driver not attached")?;
        if let Some(channel) = io.channels.get(COUNT_CHANNEL) {
            channel.emit(next);
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let (Some(io), Some(value)) = (&self.io, self.value) {
            io.log.info(format!("Closed at count {}", value));
        }
        Ok(())
    }
}
