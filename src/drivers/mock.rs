//! A scriptable driver for tests and demos.
//!
//! Every driver built from one [`MockScript`] shares its outcomes and call
//! counters, so a test can make the first `init` fail, the second succeed, and
//! then check how many drivers the factory built.
//!
//! ```ignore
//! let script = MockScript::new();
//! script.push(Op::Init, Outcome::Fail("busy".into()));
//! catalog.register("camera", script.entry());
//! ```

use crate::driver::{Driver, DriverEntry, DriverIo};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Channel every mock driver emits acquisitions on.
pub const DATA_CHANNEL: &str = "data";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// A scripted driver operation.
pub enum Op {
    /// The factory call.
    Build,
    /// `Driver::init`.
    Init,
    /// `Driver::acquire`.
    Acquire,
    /// `Driver::close`.
    Close,
    /// `Driver::teardown`.
    Teardown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// What a scripted operation does when called.
pub enum Outcome {
    /// Return `Ok(())`.
    Succeed,
    /// Return an error with this message.
    Fail(String),
    /// Panic inside the call.
    Panic,
    /// Never complete. Only meaningful with an operation timeout.
    Hang,
}

#[derive(Default)]
struct ScriptState {
    defaults: HashMap<Op, Outcome>,
    queued: HashMap<Op, VecDeque<Outcome>>,
    calls: HashMap<Op, usize>,
    ui_outputs: Vec<String>,
}

/// Shared outcomes and counters for mock drivers.
#[derive(Clone, Default)]
pub struct MockScript {
    state: Arc<Mutex<ScriptState>>,
}

impl MockScript {
    /// A script where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Outcome of every future `op` call without a queued outcome.
    pub fn set(&self, op: Op, outcome: Outcome) {
        self.state().defaults.insert(op, outcome);
    }

    /// Outcome of the next `op` call only. Queued outcomes are used in order.
    pub fn push(&self, op: Op, outcome: Outcome) {
        self.state().queued.entry(op).or_default().push_back(outcome);
    }

    /// UI bindings declared by drivers built from now on.
    pub fn set_ui_outputs<I, S>(&self, bindings: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().ui_outputs = bindings.into_iter().map(Into::into).collect();
    }

    /// How many times `op` ran across every driver built from this script.
    pub fn calls(&self, op: Op) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    fn next(&self, op: Op) -> Outcome {
        let mut state = self.state();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(outcome) = state.queued.get_mut(&op).and_then(VecDeque::pop_front) {
            return outcome;
        }
        state.defaults.get(&op).cloned().unwrap_or(Outcome::Succeed)
    }

    /// A new driver bound to this script. Does not count as a `Build`.
    pub fn driver(&self) -> MockDriver {
        MockDriver {
            script: self.clone(),
            ui_outputs: self.state().ui_outputs.clone(),
            io: None,
            acquisitions: 0,
        }
    }

    /// A catalog entry whose factory consults `Op::Build` before building.
    #[allow(clippy::panic)]
    pub fn entry(&self) -> DriverEntry {
        let script = self.clone();
        DriverEntry::new(move |_config| {
            match script.next(Op::Build) {
                Outcome::Succeed => {}
                Outcome::Fail(msg) => return Err(anyhow!(msg)),
                Outcome::Panic => panic!("mock factory panicked"),
                Outcome::Hang => return Err(anyhow!("a factory cannot hang")),
            }
            Ok(Box::new(script.driver()) as Box<dyn Driver>)
        })
    }
}

#[allow(clippy::panic)]
async fn perform(op: Op, outcome: Outcome) -> anyhow::Result<()> {
    match outcome {
        Outcome::Succeed => Ok(()),
        Outcome::Fail(msg) => Err(anyhow!(msg)),
        Outcome::Panic => panic!("mock {:?} panicked", op),
        Outcome::Hang => {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}

/// Driver whose behavior comes from a [`MockScript`].
pub struct MockDriver {
    script: MockScript,
    ui_outputs: Vec<String>,
    io: Option<DriverIo>,
    acquisitions: u64,
}

impl MockDriver {
    fn emit(&self, payload: serde_json::Value) {
        if let Some(channel) = self.io.as_ref().and_then(|io| io.channels.get(DATA_CHANNEL)) {
            channel.emit(payload);
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn outputs(&self) -> Vec<String> {
        vec![DATA_CHANNEL.to_string()]
    }

    fn ui_outputs(&self) -> Vec<String> {
        self.ui_outputs.clone()
    }

    fn attach(&mut self, io: DriverIo) {
        self.io = Some(io);
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        let outcome = self.script.next(Op::Init);
        perform(Op::Init, outcome).await
    }

    async fn acquire(&mut self) -> anyhow::Result<()> {
        let outcome = self.script.next(Op::Acquire);
        perform(Op::Acquire, outcome).await?;
        self.acquisitions += 1;
        self.emit(serde_json::json!({ "acquisition": self.acquisitions }));
        if let Some(io) = &self.io {
            for channel in io.ui_channels.names() {
                if let Some(ui) = io.ui_channels.get(channel) {
                    ui.emit(self.acquisitions);
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        // Anyone still listening to this driver would see it.
        self.emit(serde_json::json!("closing"));
        let outcome = self.script.next(Op::Close);
        perform(Op::Close, outcome).await
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        let outcome = self.script.next(Op::Teardown);
        perform(Op::Teardown, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;

    #[tokio::test]
    async fn test_queued_outcomes_then_default() {
        let script = MockScript::new();
        script.set(Op::Init, Outcome::Fail("always".into()));
        script.push(Op::Init, Outcome::Succeed);

        let mut driver = script.driver();
        assert!(driver.init().await.is_ok());
        let err = driver.init().await.unwrap_err();
        assert_eq!(err.to_string(), "always");
        assert_eq!(script.calls(Op::Init), 2);
    }

    #[test]
    fn test_entry_counts_builds() {
        let script = MockScript::new();
        script.push(Op::Build, Outcome::Fail("no port".into()));
        let entry = script.entry();
        let config = InstrumentConfig::new();

        assert!(entry.build(&config).is_err());
        assert!(entry.build(&config).is_ok());
        assert_eq!(script.calls(Op::Build), 2);
    }
}
