//! Event encoding.
//!
//! Events carry arbitrary JSON payload values. Graphite only stores numbers,
//! so numeric payloads (and strings that parse as numbers) keep their value
//! and everything else is written as `0`. The resulting records go through
//! the regular protocol encoders.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Protocol;
use crate::record::Record;

/// A timestamped event with a loosely typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Metric path.
    pub path: String,
    /// Event instant.
    pub timestamp: SystemTime,
    /// Raw payload value.
    pub value: Value,
    /// Tags, in order.
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

impl Event {
    /// Creates a tagless event.
    pub fn new(path: impl Into<String>, value: Value, timestamp: SystemTime) -> Self {
        Self {
            path: path.into(),
            timestamp,
            value,
            tags: Vec::new(),
        }
    }

    /// Converts the event into a numeric record.
    pub fn to_record(&self) -> Record {
        Record::new(self.path.clone(), numeric_value(&self.value), self.timestamp)
            .with_tags(self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// The numeric reading of a payload, or `0` when it has none.
pub fn numeric_value(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Encodes a batch of events with the given protocol.
pub fn encode(protocol: Protocol, events: &[Event]) -> Vec<u8> {
    let records: Vec<Record> = events.iter().map(Event::to_record).collect();
    protocol.encode(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_numeric_value() {
        assert_eq!(numeric_value(&json!(42)), 42.0);
        assert_eq!(numeric_value(&json!(-1.5)), -1.5);
        assert_eq!(numeric_value(&json!(" 7.25 ")), 7.25);
        assert_eq!(numeric_value(&json!("deploy finished")), 0.0);
        assert_eq!(numeric_value(&json!(true)), 0.0);
        assert_eq!(numeric_value(&Value::Null), 0.0);
        assert_eq!(numeric_value(&json!({"a": 1})), 0.0);
    }

    #[test]
    fn test_encode_substitutes_zero() {
        let events = [
            Event::new("deploys", json!("v1.2.3"), at(10)),
            Event::new("latency", json!(12), at(11)),
        ];
        assert_eq!(
            encode(Protocol::Plaintext, &events),
            b"deploys 0 10\nlatency 12 11\n"
        );
    }

    #[test]
    fn test_tags_carry_over() {
        let mut event = Event::new("deploys", json!(1), at(0));
        event.tags.push(("app".to_string(), "api".to_string()));
        assert_eq!(encode(Protocol::Plaintext, &[event]), b"deploys;app=api 1 0\n");
    }
}
