//! Multi-instrument acquisition supervisor.
//!
//! Loads a set of independent instruments from configuration, runs each one on
//! its own worker, routes named trigger events to the instruments subscribed to
//! them, and reports status, errors and readiness on a shared signal bus. One
//! misbehaving instrument degrades to `Error` without affecting the others.
//!
//! # Architecture
//!
//! ```text
//! host / CLI
//!     |  load_all, dispatch_trigger, reset, shutdown
//!     v
//! Supervisor ---- TriggerRouter (tag -> context indices)
//!     |
//!     +-- InstrumentContext #0 --jobs--> ContextWorker --> Box<dyn Driver>
//!     +-- InstrumentContext #1 --jobs--> ContextWorker --> Box<dyn Driver>
//!     |
//!     +-- SignalBus: status, errors, ready, acquisitions, progress, logs
//! ```
//!
//! - [`config`]: supervisor file (figment) and per-instrument configs
//! - [`bus`]: typed publish/subscribe signals and driver output channels
//! - [`lifecycle`]: the pure instrument state machine
//! - [`trigger`]: source parsing, routing, and interval timers
//! - [`driver`]: the driver trait, factories and UI binding
//! - [`context`]: one instrument and its worker
//! - [`supervisor`]: the host-facing API
//! - [`drivers`]: simulated drivers used by tests and the binary

pub mod bus;
pub mod config;
pub mod context;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod supervisor;
pub mod trigger;

pub use bus::{Channel, ChannelSet, Emission, Signal, SignalBus, Subscription};
pub use config::{InstrumentConfig, InstrumentEntry, SupervisorConfig};
pub use context::{InstrumentContext, InstrumentSnapshot};
pub use driver::{Driver, DriverCatalog, DriverEntry, DriverIo, UiSurface};
pub use error::{InstrumentError, SupervisorError, SupervisorResult};
pub use lifecycle::LifecycleState;
pub use supervisor::{LoadReport, ShutdownTarget, Supervisor};
