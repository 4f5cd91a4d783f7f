//! Trigger recognition.
//!
//! Decides when typed input becomes a generation request: the backtick
//! sentinel, the extension window after a completion, and the live-mode
//! idle timer. Hotkey commands are recognized upstream by the observer and
//! only classified here.
//!
//! Tie-breaking: the sentinel always wins over a live-idle firing, and a
//! trigger acceptance freezes recognition until the session resolves.

use std::time::{Duration, Instant};

use crate::buffer::BufferSnapshot;
use crate::observer::detector::HotkeyAction;
use crate::observer::ActiveContext;

/// Re-trigger within this window (with no typing) extends the prior output.
pub const T_EXTEND: Duration = Duration::from_secs(2);

/// Printable-key idle that fires a live grammar fix.
pub const T_LIVE: Duration = Duration::from_millis(700);

/// Live mode needs at least this many buffered characters.
pub const LIVE_MIN_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// `<text>` + backtick + Enter.
    Backtick,
    /// Re-trigger shortly after a completion, no typing in between.
    Extension,
    /// Idle pause in live mode.
    Live,
    /// A global hotkey command.
    Hotkey(HotkeyAction),
    /// Clipboard hotkey with a nonempty buffer as the instruction.
    ClipboardWithInstruction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPayload {
    None,
    Clipboard {
        text: String,
    },
    ClipboardWithInstruction {
        text: String,
        instruction: String,
    },
    Extension {
        last_output: String,
        context: String,
    },
    Screenshot {
        image: Option<Vec<u8>>,
    },
}

/// One recognized trigger, carrying everything the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub buffer: BufferSnapshot,
    /// Keystrokes to erase if this session injects. Not always equal to
    /// `buffer.raw_count` — hotkey modes that do not consume typed text
    /// carry zero.
    pub raw_count: usize,
    pub context: ActiveContext,
    pub payload: TriggerPayload,
}

/// What a sentinel/generate firing turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireKind {
    GrammarFix,
    Extension { last_output: String, context: String },
}

#[derive(Debug)]
pub struct TriggerRecognizer {
    live_mode: bool,
    frozen: bool,
    sentinel_armed: bool,
    live_deadline: Option<Instant>,
    last_completion: Option<Instant>,
    typed_since_completion: bool,
    last_ai_output: String,
    extension_context: String,
}

impl TriggerRecognizer {
    pub fn new(live_mode: bool) -> Self {
        Self {
            live_mode,
            frozen: false,
            sentinel_armed: false,
            live_deadline: None,
            last_completion: None,
            typed_since_completion: true,
            last_ai_output: String::new(),
            extension_context: String::new(),
        }
    }

    pub fn set_live_mode(&mut self, enabled: bool) {
        self.live_mode = enabled;
        if !enabled {
            self.live_deadline = None;
        }
    }

    pub fn live_mode(&self) -> bool {
        self.live_mode
    }

    /// Freeze recognition for the lifetime of an accepted session.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.live_deadline = None;
        self.sentinel_armed = false;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn sentinel_armed(&self) -> bool {
        self.sentinel_armed
    }

    /// Deadline for the input task's timer, if a live firing is armed.
    pub fn live_deadline(&self) -> Option<Instant> {
        if self.frozen || !self.live_mode {
            None
        } else {
            self.live_deadline
        }
    }

    /// A printable character was appended. `buffered_chars` is the buffer
    /// length after the append.
    pub fn note_printable(&mut self, now: Instant, buffered_chars: usize, sensitive: bool) {
        self.sentinel_armed = false;
        self.typed_since_completion = true;
        self.arm_live(now, buffered_chars, sensitive);
    }

    /// Backspace edits arm the live timer too (the user is still working).
    pub fn note_backspace(&mut self, now: Instant, buffered_chars: usize, sensitive: bool) {
        self.sentinel_armed = false;
        self.typed_since_completion = true;
        self.arm_live(now, buffered_chars, sensitive);
    }

    /// The backtick sentinel key. Never buffered, does not count as typing
    /// for the extension window.
    pub fn note_backtick(&mut self) {
        self.sentinel_armed = true;
        self.live_deadline = None;
    }

    /// Enter. Fires the sentinel when armed; otherwise cancels a pending
    /// live firing (a finished line is not auto-fixed).
    pub fn note_enter(&mut self, now: Instant) -> Option<FireKind> {
        self.live_deadline = None;
        if self.sentinel_armed {
            self.sentinel_armed = false;
            if self.frozen {
                return None;
            }
            return Some(self.decide_fire(now));
        }
        self.typed_since_completion = true;
        None
    }

    /// The caret moved or the buffer was reset: nothing pending survives.
    pub fn note_reset(&mut self) {
        self.sentinel_armed = false;
        self.live_deadline = None;
        self.typed_since_completion = true;
    }

    /// The Generate hotkey behaves like a sentinel firing: grammar fix, or
    /// extension inside the window.
    pub fn fire_generate(&mut self, now: Instant) -> Option<FireKind> {
        if self.frozen {
            return None;
        }
        self.sentinel_armed = false;
        self.live_deadline = None;
        Some(self.decide_fire(now))
    }

    /// The live deadline elapsed. Returns true when a live trigger should
    /// fire now.
    pub fn fire_live(&mut self, buffered_chars: usize) -> bool {
        self.live_deadline = None;
        !self.frozen && self.live_mode && buffered_chars >= LIVE_MIN_CHARS
    }

    /// A generation completed; arm the extension window.
    pub fn on_completion(&mut self, now: Instant, output: String, context: String) {
        self.last_completion = Some(now);
        self.typed_since_completion = false;
        self.last_ai_output = output;
        self.extension_context = context;
    }

    pub fn last_ai_output(&self) -> &str {
        &self.last_ai_output
    }

    fn decide_fire(&mut self, now: Instant) -> FireKind {
        let in_window = self
            .last_completion
            .map(|t| now.duration_since(t) < T_EXTEND)
            .unwrap_or(false);

        if in_window && !self.typed_since_completion && !self.last_ai_output.is_empty() {
            // Re-arm the window relative to this firing.
            self.last_completion = Some(now);
            FireKind::Extension {
                last_output: self.last_ai_output.clone(),
                context: self.extension_context.clone(),
            }
        } else {
            FireKind::GrammarFix
        }
    }

    fn arm_live(&mut self, now: Instant, buffered_chars: usize, sensitive: bool) {
        if self.live_mode && !self.frozen && !sensitive && buffered_chars >= LIVE_MIN_CHARS {
            self.live_deadline = Some(now + T_LIVE);
        } else {
            self.live_deadline = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn sentinel_then_enter_fires_grammar_fix() {
        let mut r = TriggerRecognizer::new(false);
        r.note_printable(now(), 6, false);
        r.note_backtick();
        assert!(r.sentinel_armed());
        assert_eq!(r.note_enter(now()), Some(FireKind::GrammarFix));
        assert!(!r.sentinel_armed());
    }

    #[test]
    fn enter_without_sentinel_does_not_fire() {
        let mut r = TriggerRecognizer::new(false);
        r.note_printable(now(), 3, false);
        assert_eq!(r.note_enter(now()), None);
    }

    #[test]
    fn typing_after_backtick_disarms_sentinel() {
        let mut r = TriggerRecognizer::new(false);
        r.note_backtick();
        r.note_printable(now(), 1, false);
        assert_eq!(r.note_enter(now()), None);
    }

    #[test]
    fn extension_fires_inside_window_without_typing() {
        let mut r = TriggerRecognizer::new(false);
        let t0 = now();
        r.on_completion(t0, "Hello".into(), "hellow".into());
        let fire = r.fire_generate(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(
            fire,
            FireKind::Extension {
                last_output: "Hello".into(),
                context: "hellow".into()
            }
        );
    }

    #[test]
    fn extension_window_expires() {
        let mut r = TriggerRecognizer::new(false);
        let t0 = now();
        r.on_completion(t0, "Hello".into(), String::new());
        let fire = r.fire_generate(t0 + T_EXTEND + Duration::from_millis(1)).unwrap();
        assert_eq!(fire, FireKind::GrammarFix);
    }

    #[test]
    fn typing_breaks_the_extension_window() {
        let mut r = TriggerRecognizer::new(false);
        let t0 = now();
        r.on_completion(t0, "Hello".into(), String::new());
        r.note_printable(t0 + Duration::from_millis(100), 1, false);
        let fire = r.fire_generate(t0 + Duration::from_millis(200)).unwrap();
        assert_eq!(fire, FireKind::GrammarFix);
    }

    #[test]
    fn double_sentinel_extends() {
        let mut r = TriggerRecognizer::new(false);
        let t0 = now();
        r.note_printable(t0, 6, false);
        r.note_backtick();
        assert_eq!(r.note_enter(t0), Some(FireKind::GrammarFix));
        r.on_completion(t0, "Hello".into(), String::new());
        // Second sentinel right away, no typing in between.
        r.note_backtick();
        let fire = r.note_enter(t0 + Duration::from_millis(300)).unwrap();
        assert!(matches!(fire, FireKind::Extension { .. }));
    }

    #[test]
    fn live_arms_only_with_enough_chars_and_no_sensitivity() {
        let mut r = TriggerRecognizer::new(true);
        let t0 = now();
        r.note_printable(t0, 2, false);
        assert!(r.live_deadline().is_none());
        r.note_printable(t0, 3, false);
        assert_eq!(r.live_deadline(), Some(t0 + T_LIVE));
        r.note_printable(t0, 10, true);
        assert!(r.live_deadline().is_none());
    }

    #[test]
    fn live_fire_respects_min_chars_and_freeze() {
        let mut r = TriggerRecognizer::new(true);
        assert!(!r.fire_live(2));
        assert!(r.fire_live(3));
        r.freeze();
        assert!(!r.fire_live(10));
    }

    #[test]
    fn sentinel_wins_over_live() {
        let mut r = TriggerRecognizer::new(true);
        let t0 = now();
        r.note_printable(t0, 5, false);
        assert!(r.live_deadline().is_some());
        r.note_backtick();
        // Arming the sentinel cancels the pending live firing.
        assert!(r.live_deadline().is_none());
    }

    #[test]
    fn enter_cancels_live_timer() {
        let mut r = TriggerRecognizer::new(true);
        let t0 = now();
        r.note_printable(t0, 5, false);
        assert!(r.live_deadline().is_some());
        r.note_enter(t0);
        assert!(r.live_deadline().is_none());
    }

    #[test]
    fn freeze_blocks_all_firing() {
        let mut r = TriggerRecognizer::new(true);
        r.freeze();
        assert!(r.fire_generate(now()).is_none());
        r.note_backtick();
        assert_eq!(r.note_enter(now()), None);
        r.unfreeze();
        assert!(r.fire_generate(now()).is_some());
    }
}
