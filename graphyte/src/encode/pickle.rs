//! Carbon pickle protocol.
//!
//! Carbon's pickle listener reads a 4-byte big-endian length header followed
//! by a pickled list of `(path, (timestamp, value))` tuples. Only the
//! protocol-1 opcode subset below is emitted:
//!
//! | Opcode | Byte | Effect                                 |
//! |--------|------|----------------------------------------|
//! | MARK   | `(`  | push a mark                            |
//! | LIST   | `l`  | build a list from items above the mark |
//! | STRING | `S`  | push a quoted string up to `\n`        |
//! | LONG   | `L`  | push an integer written as `<n>L\n`    |
//! | TUPLE  | `t`  | build a tuple from items above the mark|
//! | APPEND | `a`  | append the top item to the list below  |
//! | STOP   | `.`  | end of pickle                          |
//!
//! Each record becomes `(S'<path>'\n(L<ts>L\nS'<value>'\ntta`, and the
//! payload is `(l` + records + `.`. The value travels as a string, which
//! Carbon converts with `float()`.

use super::format_value;
use crate::record::Record;
use crate::sanitize::sanitize;

const MARK: u8 = b'(';
const LIST: u8 = b'l';
const STRING: u8 = b'S';
const LONG: u8 = b'L';
const TUPLE: u8 = b't';
const APPEND: u8 = b'a';
const STOP: u8 = b'.';

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Encodes a batch as one length-prefixed pickle frame.
///
/// # Panics
///
/// Panics if the payload exceeds `u32::MAX` bytes, which the 4-byte header
/// cannot describe.
pub fn encode(records: &[Record]) -> Vec<u8> {
    let payload = encode_payload(records);
    let len = u32::try_from(payload.len()).expect("pickle payload exceeds 4 GiB");

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Encodes the pickle payload without the length header.
pub fn encode_payload(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + records.len() * 48 + 1);
    out.push(MARK);
    out.push(LIST);

    for record in records {
        out.push(MARK);
        push_string(&mut out, &tagged_path(record));
        out.push(MARK);
        push_long(&mut out, record.epoch_seconds());
        push_string(&mut out, &format_value(record.value()));
        out.push(TUPLE);
        out.push(TUPLE);
        out.push(APPEND);
    }

    out.push(STOP);
    out
}

/// `path;key=value;...` with every component sanitized.
fn tagged_path(record: &Record) -> String {
    let mut path = sanitize(record.path());
    for (key, value) in record.tags() {
        path.push(';');
        path.push_str(&sanitize(key));
        path.push('=');
        path.push_str(&sanitize(value));
    }
    path
}

/// Writes `S'<text>'\n`, escaping the characters a Python string literal
/// cannot hold raw.
fn push_string(out: &mut Vec<u8>, text: &str) {
    out.push(STRING);
    out.push(b'\'');
    for byte in text.bytes() {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            _ => out.push(byte),
        }
    }
    out.push(b'\'');
    out.push(b'\n');
}

/// Writes `L<n>L\n`.
fn push_long(out: &mut Vec<u8>, n: i64) {
    out.push(LONG);
    out.extend_from_slice(n.to_string().as_bytes());
    out.push(b'L');
    out.push(b'\n');
}
