//! Carbon plaintext line protocol.
//!
//! One line per record:
//!
//! ```text
//! <path>[;<key>=<value>]* <value> <epoch_seconds>\n
//! ```
//!
//! Path and tags are passed through
//! [`sanitize_normalized`](crate::sanitize::sanitize_normalized).

use std::fmt::Write as _;

use super::format_value;
use crate::record::Record;
use crate::sanitize::sanitize_normalized;

/// Encodes a batch as newline-terminated plaintext lines.
pub fn encode(records: &[Record]) -> Vec<u8> {
    let mut out = String::with_capacity(records.len() * 48);
    for record in records {
        write_line(&mut out, record);
    }
    out.into_bytes()
}

fn write_line(out: &mut String, record: &Record) {
    out.push_str(&sanitize_normalized(record.path()));
    for (key, value) in record.tags() {
        out.push(';');
        out.push_str(&sanitize_normalized(key));
        out.push('=');
        out.push_str(&sanitize_normalized(value));
    }
    // Writing to a String cannot fail.
    let _ = writeln!(
        out,
        " {} {}",
        format_value(record.value()),
        record.epoch_seconds()
    );
}
