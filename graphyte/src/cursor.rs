//! Incremental poll cursor.
//!
//! The cursor is the newest datapoint timestamp (epoch seconds) observed
//! across every series of every successful poll. The next query starts one
//! second after it, and datapoints at or before it are dropped so a backend
//! that ignores `from` still never yields a record twice.
//!
//! Per-target maxima are kept alongside for introspection; they do not
//! influence the query window.

use std::collections::BTreeMap;

/// Last-seen timestamps of a polling reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCursor {
    last_seen: Option<i64>,
    per_target: BTreeMap<String, i64>,
}

impl PollCursor {
    /// Creates an empty cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing has been observed since creation or the last reset.
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_none()
    }

    /// Newest timestamp observed across all targets.
    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }

    /// Newest timestamp observed for `target`.
    pub fn target_max(&self, target: &str) -> Option<i64> {
        self.per_target.get(target).copied()
    }

    /// Lower bound for the next query, `None` while the cursor is empty.
    pub fn next_from(&self) -> Option<i64> {
        self.last_seen.map(|ts| ts.saturating_add(1))
    }

    /// Whether a datapoint at `timestamp` has not been delivered yet.
    pub fn is_new(&self, timestamp: i64) -> bool {
        self.last_seen.is_none_or(|seen| timestamp > seen)
    }

    /// Records a delivered datapoint of `target`.
    pub fn advance(&mut self, target: &str, timestamp: i64) {
        self.per_target
            .entry(target.to_string())
            .and_modify(|max| *max = (*max).max(timestamp))
            .or_insert(timestamp);
        self.last_seen = Some(self.last_seen.map_or(timestamp, |seen| seen.max(timestamp)));
    }

    /// Forgets everything.
    pub fn reset(&mut self) {
        self.last_seen = None;
        self.per_target.clear();
    }
}
