//! Text escaping across the injector process boundary.
//!
//! The escape alphabet is pinned to exactly `\\ \n \r \t`. The injector
//! rejects any other `\x` sequence so a version-skewed daemon fails loudly
//! instead of typing garbage.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnescapeError {
    #[error("unknown escape sequence '\\{0}'")]
    UnknownEscape(char),
    #[error("dangling backslash at end of input")]
    DanglingBackslash,
}

/// Escape text for the injector's argv. Left inverse of [`unescape`].
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Strict unescape. Any `\x` outside the pinned alphabet is an error.
pub fn unescape(text: &str) -> Result<String, UnescapeError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => return Err(UnescapeError::UnknownEscape(other)),
            None => return Err(UnescapeError::DanglingBackslash),
        }
    }
    Ok(out)
}
