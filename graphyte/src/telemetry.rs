//! Optional meter and event collaborators.
//!
//! The reader reports through these traits when they are supplied and skips
//! reporting entirely when they are not. Real backends live outside this
//! crate; the in-memory implementations here serve tests and the CLI.
//!
//! Meter names used by the reader:
//!
//! | Name               | Kind    | Meaning                               |
//! |--------------------|---------|---------------------------------------|
//! | `received`         | counter | records delivered in successful polls |
//! | `time_to_response` | timer   | latency of successful render queries  |
//! | `failures`         | counter | poll cycles that failed               |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Counter of records delivered by successful polls.
pub const RECEIVED: &str = "received";

/// Timer around each successful render query.
pub const TIME_TO_RESPONSE: &str = "time_to_response";

/// Counter of failed poll cycles.
pub const FAILURES: &str = "failures";

/// A monotonically increasing counter.
pub trait Counter: Send + Sync {
    /// Adds `n` to the counter.
    fn increment(&self, n: u64);
}

/// A latency recorder.
pub trait Timer: Send + Sync {
    /// Records one observation.
    fn record(&self, elapsed: Duration);
}

/// Source of named meters.
pub trait MeterRegistry: Send + Sync {
    /// Returns the counter registered under `name`, creating it if needed.
    fn counter(&self, name: &str) -> Arc<dyn Counter>;

    /// Returns the timer registered under `name`, creating it if needed.
    fn timer(&self, name: &str) -> Arc<dyn Timer>;
}

/// Outcome category of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A poll cycle completed.
    PollSucceeded,
    /// A poll cycle failed.
    PollFailed,
}

/// Sink for lifecycle events.
pub trait EventLogger: Send + Sync {
    /// Records one event.
    fn log(&self, kind: EventKind, message: &str);
}

/// Lock-free counter.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Counter for AtomicCounter {
    fn increment(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Timer that keeps a count and a running total.
#[derive(Debug, Default)]
pub struct RecordingTimer {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

impl RecordingTimer {
    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed))
    }
}

impl Timer for RecordingTimer {
    fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Registry holding meters in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    counters: Mutex<HashMap<String, Arc<AtomicCounter>>>,
    timers: Mutex<HashMap<String, Arc<RecordingTimer>>>,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the named counter, `0` if it was never created.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |c| c.get())
    }

    /// Observation count of the named timer, `0` if it was never created.
    pub fn timer_count(&self, name: &str) -> u64 {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |t| t.count())
    }
}

impl MeterRegistry for InMemoryRegistry {
    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(name.to_string()).or_default();
        Arc::clone(counter) as Arc<dyn Counter>
    }

    fn timer(&self, name: &str) -> Arc<dyn Timer> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let timer = timers.entry(name.to_string()).or_default();
        Arc::clone(timer) as Arc<dyn Timer>
    }
}

/// Event logger that keeps every event in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventLogger {
    events: Mutex<Vec<(EventKind, String)>>,
}

impl InMemoryEventLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event logged so far.
    pub fn events(&self) -> Vec<(EventKind, String)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events of `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl EventLogger for InMemoryEventLogger {
    fn log(&self, kind: EventKind, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_shared_by_name() {
        let registry = InMemoryRegistry::new();
        registry.counter(RECEIVED).increment(3);
        registry.counter(RECEIVED).increment(2);
        registry.counter(FAILURES).increment(1);

        assert_eq!(registry.counter_value(RECEIVED), 5);
        assert_eq!(registry.counter_value(FAILURES), 1);
        assert_eq!(registry.counter_value("missing"), 0);
    }

    #[test]
    fn test_timer_records() {
        let registry = InMemoryRegistry::new();
        let timer = registry.timer(TIME_TO_RESPONSE);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(5));

        assert_eq!(registry.timer_count(TIME_TO_RESPONSE), 2);
    }

    #[test]
    fn test_recording_timer_total() {
        let timer = RecordingTimer::default();
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(5));
        assert_eq!(timer.total(), Duration::from_millis(15));
    }

    #[test]
    fn test_event_logger() {
        let logger = InMemoryEventLogger::new();
        logger.log(EventKind::PollSucceeded, "ok");
        logger.log(EventKind::PollFailed, "boom");
        logger.log(EventKind::PollSucceeded, "ok");

        assert_eq!(logger.count(EventKind::PollSucceeded), 2);
        assert_eq!(logger.count(EventKind::PollFailed), 1);
        assert_eq!(logger.events()[1], (EventKind::PollFailed, "boom".to_string()));
    }
}
