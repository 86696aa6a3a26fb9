//! Built-in drivers.
//!
//! The binary has no hardware drivers of its own; it registers
//! [`builtin_entry`] for every configured instrument, which picks a simulated
//! driver from `InstrumentInfo.Model`.

pub mod counter;
pub mod mock;

pub use counter::SimulatedCounter;
pub use mock::{MockDriver, MockScript, Op, Outcome};

use crate::driver::{Driver, DriverCatalog, DriverEntry};
use anyhow::anyhow;

/// `InstrumentInfo.Model` of [`SimulatedCounter`].
pub const MODEL_COUNTER: &str = "SimulatedCounter";
/// `InstrumentInfo.Model` of a [`MockDriver`] with default outcomes.
pub const MODEL_MOCK: &str = "Mock";

/// Entry building a simulated driver chosen by `InstrumentInfo.Model`.
pub fn builtin_entry() -> DriverEntry {
    DriverEntry::new(|config| match config.model() {
        Some(MODEL_COUNTER) => Ok(Box::new(SimulatedCounter::from_config(config)?) as Box<dyn Driver>),
        Some(MODEL_MOCK) => Ok(Box::new(MockScript::new().driver()) as Box<dyn Driver>),
        Some(other) => Err(anyhow!("no built-in driver for model '{}'", other)),
        None => Err(anyhow!("InstrumentInfo.Model is not set")),
    })
}

/// A catalog mapping each of `instruments` to [`builtin_entry`].
pub fn builtin_catalog<'a, I>(instruments: I) -> DriverCatalog
where
    I: IntoIterator<Item = &'a str>,
{
    let mut catalog = DriverCatalog::new();
    for name in instruments {
        catalog.register(name, builtin_entry());
    }
    catalog
}
