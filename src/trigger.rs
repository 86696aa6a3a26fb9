//! Trigger routing.
//!
//! Every instrument declares which trigger sources it listens to in
//! `Trigger.Source` (a comma separated list, e.g. `"Camera1, Manual"`). A missing
//! or empty source list means "listen to everything" ([`TriggerSources::Any`]).
//!
//! The [`TriggerRouter`] maps a source tag to the indices of the subscribed
//! contexts; the supervisor then submits one trigger job per context. Routing is
//! a pure lookup and never waits on a context.
//!
//! A context with a `Timed` source additionally owns an [`IntervalTimer`] that
//! submits `trigger("Timed")` to its own queue while armed.

use crate::config::{InstrumentConfig, SECTION_TRIGGER};
use crate::logging::InstrumentLog;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Source entry subscribing to every tag.
pub const WILDCARD: &str = "*";
/// Tag submitted by interval timers.
pub const TIMED: &str = "Timed";
/// Tag submitted by the manual UI action.
pub const MANUAL: &str = "Manual";

/// The trigger sources an instrument subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSources {
    /// Wildcard: every tag, including tags unknown at configuration time.
    Any,
    /// A non-empty set of tags.
    Tags(BTreeSet<String>),
}

impl TriggerSources {
    /// Parse a `Trigger.Source` value. Whitespace is removed from every entry and
    /// empty entries are dropped. `None` if nothing is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let tags: BTreeSet<String> = raw
            .split(',')
            .map(|tag| tag.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|tag| !tag.is_empty())
            .collect();

        if tags.is_empty() {
            None
        } else if tags.contains(WILDCARD) {
            Some(TriggerSources::Any)
        } else {
            Some(TriggerSources::Tags(tags))
        }
    }

    /// Whether `tag` reaches a subscriber with these sources.
    pub fn matches(&self, tag: &str) -> bool {
        match self {
            TriggerSources::Any => true,
            TriggerSources::Tags(tags) => tags.contains(tag),
        }
    }

    /// True only when `Timed` is listed explicitly; a wildcard does not own a timer.
    pub fn is_timed(&self) -> bool {
        matches!(self, TriggerSources::Tags(tags) if tags.contains(TIMED))
    }
}

impl fmt::Display for TriggerSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSources::Any => f.write_str(WILDCARD),
            TriggerSources::Tags(tags) => {
                let list: Vec<&str> = tags.iter().map(String::as_str).collect();
                f.write_str(&list.join(","))
            }
        }
    }
}

/// Parsed `[Trigger]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerParams {
    /// Subscribed sources.
    pub sources: TriggerSources,
    /// Present iff `sources` contains `Timed`.
    pub interval: Option<Duration>,
}

impl TriggerParams {
    /// Read `Trigger.Source` and `Trigger.Interval`, falling back with a warning:
    /// unreadable sources become the wildcard, a bad interval becomes
    /// `default_interval`.
    pub fn from_config(
        config: &InstrumentConfig,
        default_interval: Duration,
        log: &InstrumentLog,
    ) -> Self {
        let sources = match config
            .get(SECTION_TRIGGER, "Source")
            .and_then(TriggerSources::parse)
        {
            Some(sources) => {
                log.info(format!("Triggers: {}", sources));
                sources
            }
            None => {
                log.warn("Error reading trigger parameters, defaulting to use any sources ('*')");
                TriggerSources::Any
            }
        };

        let interval = sources.is_timed().then(|| {
            let interval = match config.get_parsed::<u64>(SECTION_TRIGGER, "Interval") {
                Some(Ok(ms)) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    log.warn(format!(
                        "Error reading trigger interval, defaulting to {} ms",
                        default_interval.as_millis()
                    ));
                    default_interval
                }
            };
            log.info(format!("Interval: {} ms", interval.as_millis()));
            interval
        });

        Self { sources, interval }
    }
}

/// Maps trigger source tags to subscribed context indices.
#[derive(Debug, Default)]
pub struct TriggerRouter {
    by_tag: HashMap<String, BTreeSet<usize>>,
    wildcard: BTreeSet<usize>,
}

impl TriggerRouter {
    /// An empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `index` to `sources`, replacing any previous subscription.
    pub fn register(&mut self, index: usize, sources: &TriggerSources) {
        self.unregister(index);
        match sources {
            TriggerSources::Any => {
                self.wildcard.insert(index);
            }
            TriggerSources::Tags(tags) => {
                for tag in tags {
                    self.by_tag.entry(tag.clone()).or_default().insert(index);
                }
            }
        }
    }

    /// Remove every subscription of `index`.
    pub fn unregister(&mut self, index: usize) {
        self.wildcard.remove(&index);
        self.by_tag.retain(|_, subscribers| {
            subscribers.remove(&index);
            !subscribers.is_empty()
        });
    }

    /// Every index subscribed to `tag`, wildcard subscribers included, ascending.
    pub fn route(&self, tag: &str) -> Vec<usize> {
        let mut targets: BTreeSet<usize> = self.wildcard.clone();
        if let Some(subscribers) = self.by_tag.get(tag) {
            targets.extend(subscribers.iter().copied());
        }
        targets.into_iter().collect()
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        let mut all: BTreeSet<usize> = self.wildcard.clone();
        for subscribers in self.by_tag.values() {
            all.extend(subscribers.iter().copied());
        }
        all.len()
    }

    /// Whether no context is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cancellable periodic timer owned by one context.
#[derive(Debug, Default)]
pub struct IntervalTimer {
    task: Option<JoinHandle<()>>,
    period: Option<Duration>,
}

impl IntervalTimer {
    /// A disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer. The first tick fires one `period` from now.
    /// `tick` returning `false` stops the timer, e.g. when the context is gone.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start<F>(&mut self, period: Duration, mut tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.stop();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick() {
                    break;
                }
            }
        });
        self.task = Some(task);
        self.period = Some(period);
    }

    /// Disarm the timer. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.period = None;
    }

    /// Whether the timer task is running.
    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Current period while armed.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
