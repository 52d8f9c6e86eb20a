//! Path and tag normalization.
//!
//! Graphite paths are whitespace-sensitive and case-sensitive on the server
//! side, so everything written to the wire goes through one of these two
//! functions first. Both are idempotent.

use unicode_normalization::UnicodeNormalization;

/// Trims, collapses each whitespace run to a single `-`, and lowercases.
///
/// ```rust
/// use graphyte::sanitize::sanitize;
///
/// assert_eq!(sanitize("  Web Server\t01 "), "web-server-01");
/// ```
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_whitespace = false;

    for c in input.trim().chars() {
        if c.is_whitespace() {
            in_whitespace = true;
            continue;
        }
        if in_whitespace {
            out.push('-');
            in_whitespace = false;
        }
        out.extend(c.to_lowercase());
    }

    out
}

/// [`sanitize`] followed by Unicode NFKD normalization.
///
/// Compatibility decompositions can introduce whitespace (for example
/// `U+203E OVERLINE` decomposes to a space and a combining mark), so the
/// normalized text is folded once more to keep the function idempotent.
///
/// ```rust
/// use graphyte::sanitize::sanitize_normalized;
///
/// assert_eq!(sanitize_normalized("Ｃaf\u{e9} ﬁle"), "cafe\u{301}-file");
/// ```
pub fn sanitize_normalized(input: &str) -> String {
    let collapsed = sanitize(input);
    if collapsed.is_ascii() {
        return collapsed;
    }
    let decomposed: String = collapsed.nfkd().collect();
    sanitize(&decomposed)
}
