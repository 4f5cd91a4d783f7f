//! Rolling text buffer fed by the key observer.
//!
//! The buffer mirrors what the user has typed contiguously since the last
//! reset. It is owned exclusively by the input task; the orchestrator only
//! ever asks for snapshots and resets.
//!
//! Raw-count tracks character-producing keystrokes, not string length:
//! an injection must erase keystrokes, and a composed grapheme may have
//! taken a single key press.

use unicode_normalization::UnicodeNormalization;

/// Hard cap on stored text. Overflow truncates from the head so the buffer
/// always holds the most recent typing.
pub const MAX_BUFFER_BYTES: usize = 16 * 1024;

/// Trigger snapshots carry at most this many trailing characters.
const SNAPSHOT_TAIL_CHARS: usize = 5_000;

#[derive(Debug, Default)]
pub struct TextBuffer {
    text: String,
    raw_count: usize,
    /// Number of head-truncation events since the last reset, kept for
    /// diagnostics (spec: overflow is observable).
    truncations: u64,
}

/// Immutable view captured at trigger acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub text: String,
    pub raw_count: usize,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one logical character, NFC-normalized. Counts one raw
    /// keystroke.
    pub fn push_char(&mut self, ch: char) {
        let mut buf = [0u8; 4];
        let normalized: String = ch.encode_utf8(&mut buf).nfc().collect();
        self.text.push_str(&normalized);
        self.raw_count += 1;
        self.enforce_cap();
    }

    /// Remove the last character. Always counts one raw keystroke, even on
    /// an empty buffer: the key still moved the caret in the target app.
    pub fn backspace(&mut self) {
        self.text.pop();
        self.raw_count += 1;
    }

    /// Delete `n` characters from the tail without touching raw-count.
    /// Used when the recognizer consumes sentinel characters.
    pub fn truncate_chars(&mut self, n: usize) {
        for _ in 0..n {
            if self.text.pop().is_none() {
                break;
            }
        }
    }

    /// Count a keystroke that produced no buffer text (sentinel keys).
    pub fn bump_raw(&mut self) {
        self.raw_count += 1;
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.raw_count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn raw_count(&self) -> usize {
        self.raw_count
    }

    pub fn truncations(&self) -> u64 {
        self.truncations
    }

    /// Snapshot for a trigger: the text tail (capped) plus the full
    /// raw-count. The raw-count is deliberately uncapped — every keystroke
    /// since reset must be erased on inject.
    pub fn snapshot(&self) -> BufferSnapshot {
        let char_len = self.char_len();
        let text = if char_len > SNAPSHOT_TAIL_CHARS {
            let skip = char_len - SNAPSHOT_TAIL_CHARS;
            self.text.chars().skip(skip).collect()
        } else {
            self.text.clone()
        };
        BufferSnapshot {
            text,
            raw_count: self.raw_count,
        }
    }

    fn enforce_cap(&mut self) {
        if self.text.len() <= MAX_BUFFER_BYTES {
            return;
        }
        // Drop whole characters from the head until under the cap.
        let mut cut = 0;
        let excess = self.text.len() - MAX_BUFFER_BYTES;
        for (idx, _) in self.text.char_indices() {
            if idx >= excess {
                cut = idx;
                break;
            }
        }
        self.text.drain(..cut);
        self.truncations += 1;
        log::warn!(
            "text buffer overflow, truncated from head (total truncations: {})",
            self.truncations
        );
    }
}
