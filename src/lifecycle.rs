//! Instrument lifecycle state machine.
//!
//! ```text
//!                  start             init ok
//! Uninitialized ---------> Initializing ------> Ready <-----------+
//!       |                      |  ^               |  trigger      | acquire ok
//!       |                      |  | reset         v               |
//!       |            init err  |  +---------- Acquiring ----------+
//!       |                      v  |               | acquire err
//!       |                     Error <-------------+
//!       |                      |
//!       +----------------------+--------> Shutdown  (close, terminal)
//! ```
//!
//! [`transition`] is pure: it computes the next state and the effects the caller
//! must apply (status publish, ready publish, error publish). The context worker
//! owns the only copy of the state and is the only caller.

use crate::error::InstrumentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status text published when a context reaches `Ready`.
pub const STATUS_READY: &str = "Ready";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Where an instrument is in its lifecycle.
pub enum LifecycleState {
    /// Loaded, worker not started.
    Uninitialized,
    /// Running `init`.
    Initializing,
    /// Accepting triggers.
    Ready,
    /// The last init or acquire failed. Only a reset leaves this state.
    Error,
    /// Running `acquire` for an accepted trigger.
    Acquiring,
    /// Terminal.
    Shutdown,
}

impl LifecycleState {
    /// Name used as status text.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "Uninitialized",
            LifecycleState::Initializing => "Initializing",
            LifecycleState::Ready => STATUS_READY,
            LifecycleState::Error => "Error",
            LifecycleState::Acquiring => "Acquiring",
            LifecycleState::Shutdown => "Shutdown",
        }
    }

    /// Only a ready context accepts a trigger.
    pub fn accepts_trigger(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Shutdown)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// The worker starts.
    Start,
    /// `init` returned `Ok`.
    InitSucceeded,
    /// `init` failed.
    InitFailed(InstrumentError),
    /// A subscribed trigger arrived while `Ready`.
    TriggerAccepted,
    /// `acquire` returned `Ok`.
    AcquireSucceeded,
    /// `acquire` failed.
    AcquireFailed(InstrumentError),
    /// A reset job runs.
    ResetRequested,
    /// `close` returned `Ok`.
    CloseSucceeded,
    /// `close` failed.
    CloseFailed(InstrumentError),
}

impl LifecycleEvent {
    fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Start => "start",
            LifecycleEvent::InitSucceeded => "init_succeeded",
            LifecycleEvent::InitFailed(_) => "init_failed",
            LifecycleEvent::TriggerAccepted => "trigger_accepted",
            LifecycleEvent::AcquireSucceeded => "acquire_succeeded",
            LifecycleEvent::AcquireFailed(_) => "acquire_failed",
            LifecycleEvent::ResetRequested => "reset_requested",
            LifecycleEvent::CloseSucceeded => "close_succeeded",
            LifecycleEvent::CloseFailed(_) => "close_failed",
        }
    }
}

/// Side effects requested by a transition, applied in order by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Publish `(index, status)`.
    Status(String),
    /// Clear the current error and publish a readiness event.
    Ready,
    /// Record the error, publish `(index, error)`, and set the status to its text.
    Error(InstrumentError),
}

#[derive(Clone, Debug, PartialEq)]
/// Outcome of a legal event: the next state and what to publish.
pub struct Transition {
    /// Next state.
    pub state: LifecycleState,
    /// In application order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(state: LifecycleState) -> Self {
        let effects = match state {
            LifecycleState::Ready => vec![Effect::Status(STATUS_READY.to_string()), Effect::Ready],
            other => vec![Effect::Status(other.as_str().to_string())],
        };
        Self { state, effects }
    }

    fn failed(state: LifecycleState, error: InstrumentError) -> Self {
        Self {
            state,
            effects: vec![Effect::Error(error)],
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event '{event}' is not valid in state {state}")]
/// An event that is not valid in the current state.
pub struct IllegalTransition {
    /// State the event arrived in.
    pub state: LifecycleState,
    /// Event name.
    pub event: &'static str,
}

/// Compute the next state for `event` in `state`.
pub fn transition(
    state: LifecycleState,
    event: LifecycleEvent,
) -> Result<Transition, IllegalTransition> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (state, event) {
        (S::Uninitialized, E::Start) => Ok(Transition::to(S::Initializing)),

        (S::Initializing, E::InitSucceeded) => Ok(Transition::to(S::Ready)),
        (S::Initializing, E::InitFailed(err)) => Ok(Transition::failed(S::Error, err)),

        (S::Ready, E::TriggerAccepted) => Ok(Transition::to(S::Acquiring)),
        (S::Acquiring, E::AcquireSucceeded) => Ok(Transition::to(S::Ready)),
        (S::Acquiring, E::AcquireFailed(err)) => Ok(Transition::failed(S::Error, err)),

        (S::Ready | S::Error, E::ResetRequested) => Ok(Transition::to(S::Initializing)),

        (S::Uninitialized | S::Ready | S::Error, E::CloseSucceeded) => {
            Ok(Transition::to(S::Shutdown))
        }
        (S::Uninitialized | S::Ready | S::Error, E::CloseFailed(err)) => {
            Ok(Transition::failed(S::Shutdown, err))
        }

        (state, event) => Err(IllegalTransition {
            state,
            event: event.name(),
        }),
    }
}
