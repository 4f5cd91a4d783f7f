//! Optional keystroke debug log.
//!
//! Typed text is buffered and flushed to disk as one entry per typing
//! pause (or window change). The on-disk file is a JSON array capped at
//! `MAX_LOG_ENTRIES` recent entries; it can be cleared on demand. Disabled
//! by default and never fed while a sensitive window has focus.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Flush the pending entry after this much typing silence.
const PAUSE_THRESHOLD: Duration = Duration::from_secs(1);

const MAX_LOG_ENTRIES: usize = 500;
const MAX_ENTRY_CHARS: usize = 2_000;
const MAX_WINDOW_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub text: String,
    pub window: String,
}

#[derive(Debug)]
pub struct TypingLog {
    path: PathBuf,
    pending: String,
    pending_window: String,
    last_keystroke: Option<Instant>,
}

impl TypingLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pending: String::new(),
            pending_window: String::new(),
            last_keystroke: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one typed character against the current window.
    pub fn push_char(&mut self, ch: char, window: &str) {
        if self.pending.chars().count() >= MAX_ENTRY_CHARS {
            // Entry is full; flush it and start a new one.
            self.flush();
        }
        self.pending.push(ch);
        self.pending_window = window.to_string();
        self.last_keystroke = Some(Instant::now());
    }

    pub fn backspace(&mut self) {
        self.pending.pop();
        self.last_keystroke = Some(Instant::now());
    }

    /// Flush the pending entry if the user has paused long enough.
    /// Called from the input task's periodic tick.
    pub fn flush_if_paused(&mut self, now: Instant) {
        let Some(last) = self.last_keystroke else {
            return;
        };
        if !self.pending.is_empty() && now.duration_since(last) >= PAUSE_THRESHOLD {
            self.flush();
        }
    }

    /// Unconditionally persist the pending entry (window change, shutdown).
    pub fn flush(&mut self) {
        let text = std::mem::take(&mut self.pending);
        let window = std::mem::take(&mut self.pending_window);
        self.last_keystroke = None;

        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }

        let entry = LogEntry {
            timestamp: chrono::Local::now().to_rfc3339(),
            text: text.chars().take(MAX_ENTRY_CHARS).collect(),
            window: window.chars().take(MAX_WINDOW_CHARS).collect(),
        };

        if let Err(e) = self.append_entry(entry) {
            log::warn!("typing log write failed: {}", e);
        }
    }

    /// Drop the pending entry without persisting (privacy shadow mode).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_window.clear();
        self.last_keystroke = None;
    }

    /// Remove the on-disk log.
    pub fn clear(&mut self) -> std::io::Result<()> {
        self.discard_pending();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn read_entries(&self) -> Vec<LogEntry> {
        read_entries_from(&self.path)
    }

    fn append_entry(&self, entry: LogEntry) -> std::io::Result<()> {
        let mut entries = read_entries_from(&self.path);
        entries.push(entry);
        if entries.len() > MAX_LOG_ENTRIES {
            let skip = entries.len() - MAX_LOG_ENTRIES;
            entries.drain(..skip);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, contents)
    }
}

fn read_entries_from(path: &Path) -> Vec<LogEntry> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> (tempfile::TempDir, TypingLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = TypingLog::new(dir.path().join("keylog.json"));
        (dir, log)
    }

    #[test]
    fn flush_writes_entry_with_window() {
        let (_dir, mut log) = temp_log();
        for ch in "hello there".chars() {
            log.push_char(ch, "notes.md - VS Code");
        }
        log.flush();
        let entries = log.read_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hello there");
        assert_eq!(entries[0].window, "notes.md - VS Code");
    }

    #[test]
    fn backspace_edits_pending_text() {
        let (_dir, mut log) = temp_log();
        for ch in "abcc".chars() {
            log.push_char(ch, "w");
        }
        log.backspace();
        log.flush();
        assert_eq!(log.read_entries()[0].text, "abc");
    }

    #[test]
    fn whitespace_only_pending_is_not_persisted() {
        let (_dir, mut log) = temp_log();
        log.push_char(' ', "w");
        log.push_char(' ', "w");
        log.flush();
        assert!(log.read_entries().is_empty());
    }

    #[test]
    fn log_is_capped_at_max_entries() {
        let (_dir, mut log) = temp_log();
        for i in 0..MAX_LOG_ENTRIES + 10 {
            log.push_char('x', &format!("w{}", i));
            log.flush();
        }
        let entries = log.read_entries();
        assert_eq!(entries.len(), MAX_LOG_ENTRIES);
        // Oldest entries were dropped.
        assert_eq!(entries[0].window, "w10");
    }

    #[test]
    fn clear_removes_file_and_pending() {
        let (_dir, mut log) = temp_log();
        log.push_char('x', "w");
        log.flush();
        assert_eq!(log.read_entries().len(), 1);
        log.clear().unwrap();
        assert!(log.read_entries().is_empty());
        // Clearing a missing file is fine.
        log.clear().unwrap();
    }

    #[test]
    fn flush_if_paused_respects_threshold() {
        let (_dir, mut log) = temp_log();
        log.push_char('x', "w");
        log.flush_if_paused(Instant::now());
        assert!(log.read_entries().is_empty());
        log.flush_if_paused(Instant::now() + PAUSE_THRESHOLD);
        assert_eq!(log.read_entries().len(), 1);
    }
}
