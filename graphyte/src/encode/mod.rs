//! Wire-protocol encoders for Carbon listeners.
//!
//! Carbon accepts two ingestion formats on separate ports: a line-oriented
//! plaintext format and a length-prefixed pickle format. Both encoders are
//! stateless functions from a batch of [`Record`]s to the exact bytes written
//! to the socket. Callers choose batch boundaries; encoders never split,
//! retry, or fail.
//!
//! [`Protocol`] selects the encoder. It resolves to a plain function pointer
//! through [`ENCODERS`], so a connection stores one `fn` rather than a boxed
//! trait object.
//!
//! # Example
//!
//! ```rust
//! use graphyte::Record;
//! use graphyte::encode::Protocol;
//!
//! let records = [Record::at_epoch_seconds("boo", 543.0, 0)];
//! let encode = Protocol::Plaintext.encoder();
//! assert_eq!(encode(&records), b"boo 543 0\n");
//! ```

pub mod events;
pub mod pickle;
pub mod plaintext;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::record::Record;

/// Signature shared by every wire encoder.
pub type EncodeFn = fn(&[Record]) -> Vec<u8>;

/// Encoders indexed by `Protocol as usize`.
pub const ENCODERS: [EncodeFn; 2] = [plaintext::encode, pickle::encode];

/// The Carbon ingestion protocol a connection speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// `<path> <value> <timestamp>\n` lines.
    #[default]
    Plaintext = 0,
    /// Length-prefixed pickle protocol-1 frames.
    Pickle = 1,
}

impl Protocol {
    /// Returns the stateless encode function for this protocol.
    pub fn encoder(self) -> EncodeFn {
        ENCODERS[self as usize]
    }

    /// Encodes a batch with this protocol.
    pub fn encode(self, records: &[Record]) -> Vec<u8> {
        (self.encoder())(records)
    }

    /// The port Carbon listens on for this protocol by default.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Plaintext => 2003,
            Self::Pickle => 2004,
        }
    }

    /// Lowercase protocol name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Pickle => "pickle",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" | "line" => Ok(Self::Plaintext),
            "pickle" => Ok(Self::Pickle),
            _ => Err(ConfigError::UnknownProtocol(s.to_string())),
        }
    }
}

/// Renders a value in its canonical textual form.
///
/// Uses `f64`'s `Display`, which prints the shortest string that round-trips
/// and drops a zero fraction (`543.0` becomes `543`).
pub(crate) fn format_value(value: f64) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_table_matches_variants() {
        let records = [Record::at_epoch_seconds("a.b", 1.5, 10)];
        assert_eq!(Protocol::Plaintext.encode(&records), plaintext::encode(&records));
        assert_eq!(Protocol::Pickle.encode(&records), pickle::encode(&records));
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("plaintext".parse::<Protocol>().unwrap(), Protocol::Plaintext);
        assert_eq!(" Pickle ".parse::<Protocol>().unwrap(), Protocol::Pickle);
        assert!(matches!(
            "udp".parse::<Protocol>(),
            Err(ConfigError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_protocol_serde_names() {
        let json = serde_json::to_string(&Protocol::Pickle).unwrap();
        assert_eq!(json, "\"pickle\"");
        let back: Protocol = serde_json::from_str("\"plaintext\"").unwrap();
        assert_eq!(back, Protocol::Plaintext);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Protocol::Plaintext.default_port(), 2003);
        assert_eq!(Protocol::Pickle.default_port(), 2004);
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(543.0), "543");
        assert_eq!(format_value(0.25), "0.25");
        assert_eq!(format_value(-3.5), "-3.5");
        assert_eq!(format_value(f64::NAN), "NaN");
    }
}
