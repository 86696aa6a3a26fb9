//! Signal bus: typed many-to-many publish/subscribe.
//!
//! A [`Signal<T>`] is a named broadcast point. Any number of listeners can attach
//! to it, either as a queue ([`Signal::subscribe`]) or as a synchronous callback
//! ([`Signal::connect`]). Cloning a signal shares the same listener list, so a
//! driver and the supervisor can hold the same emitter.
//!
//! Delivery guarantees:
//!
//! - Every listener sees every payload published while it was attached, in the
//!   order the payloads were published. Queue listeners are unbounded, so a slow
//!   reader never loses events (unlike `tokio::sync::broadcast`, which lags).
//! - Nothing is persisted: a listener attached after a publish does not see it.
//! - There is no ordering guarantee across different signals.
//! - Publishing never blocks on a listener and can happen from any task or thread;
//!   listeners must not assume they run on the publisher's task.
//!
//! ```text
//! ContextWorker --publish--> Signal<StatusEvent> --+--> Subscription (queue)
//!                                                  +--> callback (UI slot)
//! ```

use crate::config::InstrumentConfig;
use crate::error::InstrumentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Listener<T> {
    Queue(mpsc::UnboundedSender<T>),
    Callback(Callback<T>),
}

struct SignalInner<T> {
    name: String,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T> SignalInner<T> {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        // A panicking callback never runs under this lock, so poisoning carries no
        // broken invariant; keep going with the inner value.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: u64) {
        self.listeners().retain(|(listener_id, _)| *listener_id != id);
    }
}

/// A named broadcast emitter with any number of independent listeners.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Signal<T> {
    /// Signal name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Detach a listener previously attached with [`Signal::connect`].
    pub fn disconnect(&self, id: u64) {
        self.inner.remove(id);
    }

    /// Detach every listener. The signal stays usable for new listeners.
    pub fn disconnect_all(&self) {
        self.inner.listeners().clear();
    }

    /// Whether [`Signal::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of attached listeners (closed queues are pruned lazily on publish).
    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + 'static,
{
    /// Create a signal with no listeners.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                name: name.into(),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a queue listener. Dropping the returned subscription detaches it.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.attach(Listener::Queue(tx));
        Subscription {
            id,
            rx,
            signal: Arc::downgrade(&self.inner),
        }
    }

    /// Attach a callback listener. Returns an id usable with [`Signal::disconnect`].
    ///
    /// Callbacks run on the publishing task, outside the listener lock, so they may
    /// publish or subscribe themselves.
    pub fn connect<F>(&self, callback: F) -> u64
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.attach(Listener::Callback(Arc::new(callback)))
    }

    /// Detach every listener and drop all future publishes.
    ///
    /// Used when the driver owning this signal is discarded: a stale clone still
    /// held by the old driver can no longer reach anyone.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect_all();
    }

    /// Deliver `value` to every attached listener. Returns how many received it.
    pub fn publish(&self, value: T) -> usize {
        if self.is_closed() {
            return 0;
        }

        let mut delivered = 0;
        let mut callbacks: Vec<Callback<T>> = Vec::new();
        {
            let mut listeners = self.inner.listeners();
            listeners.retain(|(_, listener)| match listener {
                Listener::Queue(tx) => {
                    if tx.send(value.clone()).is_ok() {
                        delivered += 1;
                        true
                    } else {
                        false
                    }
                }
                Listener::Callback(callback) => {
                    callbacks.push(Arc::clone(callback));
                    true
                }
            });
        }

        for callback in callbacks {
            // A close that lands mid-delivery silences the remaining callbacks.
            if self.is_closed() {
                break;
            }
            callback(&value);
            delivered += 1;
        }
        delivered
    }

    fn attach(&self, listener: Listener<T>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners().push((id, listener));
        id
    }
}

/// A queue listener attached to a [`Signal`].
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    signal: Weak<SignalInner<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next payload. Returns `None` once the signal is closed or
    /// dropped and every queued payload has been read.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain every payload queued so far.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            out.push(value);
        }
        out
    }

    /// Detach from the signal. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.remove(self.id);
        }
    }
}

// =============================================================================
// Driver output channels
// =============================================================================

/// One value emitted on a driver output channel: the `(payload, channel-name)` pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    /// Name of the channel the payload was emitted on.
    pub channel: String,
    /// Emitted value.
    pub payload: serde_json::Value,
}

/// A driver output channel.
#[derive(Clone, Debug)]
pub struct Channel {
    signal: Signal<Emission>,
}

impl Channel {
    /// Create a fresh channel with no listeners.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            signal: Signal::new(name),
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        self.signal.name()
    }

    /// Emit a payload tagged with this channel's name.
    pub fn emit(&self, payload: impl Into<serde_json::Value>) -> usize {
        self.signal.publish(Emission {
            channel: self.signal.name().to_string(),
            payload: payload.into(),
        })
    }

    /// Attach a queue listener to this channel.
    pub fn subscribe(&self) -> Subscription<Emission> {
        self.signal.subscribe()
    }

    /// Attach a callback listener to this channel.
    pub fn connect<F>(&self, callback: F) -> u64
    where
        F: Fn(&Emission) + Send + Sync + 'static,
    {
        self.signal.connect(callback)
    }

    /// Detach every listener and drop later emissions.
    pub fn close(&self) {
        self.signal.close();
    }

    /// Whether the channel was closed, e.g. by a reset.
    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

/// The set of channels created for one driver instance, keyed by channel name.
#[derive(Clone, Debug, Default)]
pub struct ChannelSet {
    channels: HashMap<String, Channel>,
}

impl ChannelSet {
    /// Create one fresh channel per declared name. Duplicate names collapse.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), Channel::new(name))
            })
            .collect();
        Self { channels }
    }

    /// Look up a channel by name.
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Channel names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the set has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Close every channel in the set.
    pub fn close_all(&self) {
        for channel in self.channels.values() {
            channel.close();
        }
    }
}

// =============================================================================
// Supervisor-level events
// =============================================================================

/// A lifecycle status change: `(index, statusString)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Context index.
    pub index: usize,
    /// Instrument name.
    pub name: String,
    /// Status text, either a state name or an error text.
    pub status: String,
    /// When the status was published.
    pub timestamp: DateTime<Utc>,
}

/// An error assigned to an instrument: `(index, error)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Context index.
    pub index: usize,
    /// Instrument name.
    pub name: String,
    /// The recorded error.
    pub error: InstrumentError,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

/// An instrument reached `Ready`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyEvent {
    /// Context index.
    pub index: usize,
    /// Instrument name.
    pub name: String,
}

/// An accepted trigger bumped the acquisition counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionEvent {
    /// Context index.
    pub index: usize,
    /// Instrument name.
    pub name: String,
    /// Acquisition counter after the increment.
    pub count: u64,
}

/// An instrument context was constructed and added to the active set.
#[derive(Clone, Debug)]
pub struct InstrumentAdded {
    /// Assigned index.
    pub index: usize,
    /// Instrument name.
    pub name: String,
    /// Resolved data directory.
    pub data_path: PathBuf,
    /// Configuration as loaded, with `Data.absolutePath` filled in.
    pub config: InstrumentConfig,
}

/// One line from a per-instrument log sink.
#[derive(Clone, Debug)]
pub struct LogLine {
    /// Instrument the line belongs to.
    pub instrument: String,
    /// Severity.
    pub level: tracing::Level,
    /// Log text.
    pub message: String,
    /// When the line was written.
    pub timestamp: DateTime<Utc>,
}

/// The supervisor-wide signals. Cloning shares the same listeners.
#[derive(Clone, Debug)]
pub struct SignalBus {
    /// Every lifecycle status change.
    pub status: Signal<StatusEvent>,
    /// Every error assigned to an instrument.
    pub errors: Signal<ErrorEvent>,
    /// Instruments reaching `Ready`.
    pub ready: Signal<ReadyEvent>,
    /// Accepted triggers.
    pub acquisitions: Signal<AcquisitionEvent>,
    /// Carries the instrument name once a (re)built driver interface is wired.
    pub interface_ready: Signal<String>,
    /// Contexts added by `load_all`.
    pub added: Signal<InstrumentAdded>,
    /// Supervisor progress and summary messages.
    pub progress: Signal<String>,
    /// Per-instrument log lines.
    pub logs: Signal<LogLine>,
}

impl SignalBus {
    /// A bus with no listeners.
    pub fn new() -> Self {
        Self {
            status: Signal::new("status"),
            errors: Signal::new("errors"),
            ready: Signal::new("ready"),
            acquisitions: Signal::new("acquisitions"),
            interface_ready: Signal::new("interface_ready"),
            added: Signal::new("added"),
            progress: Signal::new("progress"),
            logs: Signal::new("logs"),
        }
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
