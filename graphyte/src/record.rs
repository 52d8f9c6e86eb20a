//! The measurement record shared by the export and read paths.
//!
//! A [`Record`] is a single timestamped numeric value with a hierarchical
//! dotted path and optional tags. Records are immutable: the `with_*`
//! methods consume the record and return a new one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single timestamped numeric measurement.
///
/// # Example
///
/// ```rust
/// use std::time::{Duration, UNIX_EPOCH};
/// use graphyte::Record;
///
/// let record = Record::new("servers.web1.cpu", 85.5, UNIX_EPOCH + Duration::from_secs(60))
///     .with_tag("dc", "us-east");
///
/// assert_eq!(record.epoch_seconds(), 60);
/// assert_eq!(record.tags(), &[("dc".to_string(), "us-east".to_string())]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    path: String,
    timestamp: SystemTime,
    value: f64,
    tags: Vec<(String, String)>,
}

impl Record {
    /// Creates a tagless record.
    pub fn new(path: impl Into<String>, value: f64, timestamp: SystemTime) -> Self {
        Self {
            path: path.into(),
            timestamp,
            value,
            tags: Vec::new(),
        }
    }

    /// Creates a record from a timestamp in seconds since the Unix epoch.
    ///
    /// Negative values are timestamps before the epoch.
    pub fn at_epoch_seconds(path: impl Into<String>, value: f64, epoch_seconds: i64) -> Self {
        let offset = Duration::from_secs(epoch_seconds.unsigned_abs());
        let timestamp = if epoch_seconds >= 0 {
            UNIX_EPOCH + offset
        } else {
            UNIX_EPOCH - offset
        };
        Self::new(path, value, timestamp)
    }

    /// Returns a copy of this record with one more tag.
    ///
    /// If the key is already present its value is replaced in place, so tag
    /// keys stay unique and keep their original position.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.tags.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.tags.push((key, value)),
        }
        self
    }

    /// Returns a copy of this record with all the given tags added in order.
    #[must_use]
    pub fn with_tags<I, K, V>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        tags.into_iter()
            .fold(self, |record, (k, v)| record.with_tag(k, v))
    }

    /// The metric path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The measured value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The measurement instant.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The tags, in insertion order.
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// The timestamp truncated to whole seconds since the Unix epoch.
    ///
    /// Instants before the epoch yield negative values. Instants outside the
    /// `i64` range saturate.
    pub fn epoch_seconds(&self) -> i64 {
        match self.timestamp.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
            Err(before) => {
                let before = before.duration();
                let secs = i64::try_from(before.as_secs()).map_or(i64::MIN, |s| -s);
                if before.subsec_nanos() > 0 {
                    secs.saturating_sub(1)
                } else {
                    secs
                }
            }
        }
    }
}
