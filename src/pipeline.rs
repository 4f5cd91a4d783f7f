//! Input pipeline: the synchronous core of the input task.
//!
//! Drains the observer's event stream in order, keeping the text buffer and
//! the trigger recognizer in lockstep. All decisions are made here,
//! synchronously, so a trigger acceptance snapshots the buffer atomically;
//! the async shell in `daemon` only supplies timers, the clipboard, and
//! channel plumbing.

use std::time::Instant;

use crate::buffer::TextBuffer;
use crate::keylog::TypingLog;
use crate::observer::detector::HotkeyAction;
use crate::observer::keymap::LogicalKey;
use crate::observer::{ActiveContext, ObserverEvent, RawKeyEvent};
use crate::triggers::{
    FireKind, TriggerEvent, TriggerKind, TriggerPayload, TriggerRecognizer,
};

/// Re-check the foreground window after this many key events, on top of the
/// focus tracker's 1 s poll.
const FOCUS_CHECK_KEY_INTERVAL: u32 = 100;

/// What the pipeline asks the async shell to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineAction {
    /// Deliver a recognized trigger to the orchestrator. Recognition is
    /// already frozen.
    EmitTrigger(TriggerEvent),
    /// A command hotkey that is not buffer-derived (paste, cancel, pause,
    /// overlay, settings, voice hold).
    EmitCommand { action: HotkeyAction, pressed: bool },
    /// Read the clipboard, then call [`InputPipeline::build_clipboard_trigger`].
    FetchClipboard,
    /// Capture a screenshot, then call [`InputPipeline::build_screenshot_trigger`].
    FetchScreenshot,
    /// Escape was pressed (cancel path; not a trigger).
    Escape,
    /// Ask the focus tracker for an immediate re-check.
    PokeFocus,
    /// The foreground window changed (orchestrator hides transient popups).
    FocusChanged(ActiveContext),
}

pub struct InputPipeline {
    buffer: TextBuffer,
    recognizer: TriggerRecognizer,
    keylog: Option<TypingLog>,
    context: ActiveContext,
    enabled: bool,
    keys_since_focus_check: u32,
}

impl InputPipeline {
    pub fn new(live_mode: bool, enabled: bool, keylog: Option<TypingLog>) -> Self {
        Self {
            buffer: TextBuffer::new(),
            recognizer: TriggerRecognizer::new(live_mode),
            keylog,
            context: ActiveContext::default(),
            enabled,
            keys_since_focus_check: 0,
        }
    }

    // ------------------------------------------------------------------
    // Control surface (driven by orchestrator commands)
    // ------------------------------------------------------------------

    /// Master switch. Disabled: nothing reaches the orchestrator.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.recognizer.note_reset();
        }
    }

    pub fn set_live_mode(&mut self, enabled: bool) {
        self.recognizer.set_live_mode(enabled);
    }

    /// Post-injection / forget-state reset.
    pub fn reset_buffer(&mut self) {
        self.buffer.reset();
        self.recognizer.note_reset();
    }

    /// Record a completed generation for the extension window.
    pub fn set_ai_output(&mut self, now: Instant, output: String, context: String) {
        self.recognizer.on_completion(now, output, context);
    }

    pub fn unfreeze(&mut self) {
        self.recognizer.unfreeze();
    }

    pub fn clear_keylog(&mut self) {
        if let Some(keylog) = &mut self.keylog {
            if let Err(e) = keylog.clear() {
                log::warn!("failed to clear typing log: {}", e);
            }
        }
    }

    /// Timer deadline for a pending live firing.
    pub fn live_deadline(&self) -> Option<Instant> {
        self.recognizer.live_deadline()
    }

    pub fn context(&self) -> &ActiveContext {
        &self.context
    }

    pub fn buffer_snapshot(&self) -> crate::buffer::BufferSnapshot {
        self.buffer.snapshot()
    }

    /// Periodic tick from the shell: flush the typing log on pauses.
    pub fn tick(&mut self, now: Instant) {
        if let Some(keylog) = &mut self.keylog {
            keylog.flush_if_paused(now);
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    pub fn handle(&mut self, event: ObserverEvent, now: Instant) -> Vec<PipelineAction> {
        match event {
            ObserverEvent::Key(key) => self.handle_key(key, now),
            ObserverEvent::Hotkey(hit) => self.handle_hotkey(hit.action, hit.pressed, now),
            ObserverEvent::FocusChange(ctx) => self.handle_focus_change(ctx),
        }
    }

    /// The live deadline elapsed.
    pub fn fire_live(&mut self) -> Option<TriggerEvent> {
        if !self.enabled || self.context.is_sensitive {
            return None;
        }
        if !self.recognizer.fire_live(self.buffer.char_len()) {
            return None;
        }
        Some(self.accept(TriggerKind::Live, self.buffer.raw_count(), TriggerPayload::None))
    }

    /// Second half of the clipboard hotkey, once the shell has the text.
    pub fn build_clipboard_trigger(&mut self, clipboard: String) -> Option<TriggerEvent> {
        if !self.enabled || self.context.is_sensitive || self.recognizer.is_frozen() {
            return None;
        }
        if clipboard.trim().is_empty() {
            log::info!("clipboard trigger dropped: clipboard is empty");
            return None;
        }

        if self.buffer.is_empty() {
            Some(self.accept(
                TriggerKind::Hotkey(HotkeyAction::Clipboard),
                0,
                TriggerPayload::Clipboard { text: clipboard },
            ))
        } else {
            // The typed text becomes the instruction and is erased on inject.
            let instruction = self.buffer.snapshot().text;
            let raw_count = self.buffer.raw_count();
            Some(self.accept(
                TriggerKind::ClipboardWithInstruction,
                raw_count,
                TriggerPayload::ClipboardWithInstruction {
                    text: clipboard,
                    instruction,
                },
            ))
        }
    }

    /// Second half of the screenshot hotkey.
    pub fn build_screenshot_trigger(&mut self, image: Option<Vec<u8>>) -> Option<TriggerEvent> {
        if !self.enabled || self.context.is_sensitive || self.recognizer.is_frozen() {
            return None;
        }
        Some(self.accept(
            TriggerKind::Hotkey(HotkeyAction::Screenshot),
            0,
            TriggerPayload::Screenshot { image },
        ))
    }

    fn handle_key(&mut self, key: RawKeyEvent, now: Instant) -> Vec<PipelineAction> {
        if !self.enabled || !key.is_key_down {
            return Vec::new();
        }

        // Our own injector typing: never buffered, never a trigger.
        if key.is_system_injected {
            return Vec::new();
        }

        let mut actions = Vec::new();

        self.keys_since_focus_check += 1;
        if self.keys_since_focus_check >= FOCUS_CHECK_KEY_INTERVAL {
            self.keys_since_focus_check = 0;
            actions.push(PipelineAction::PokeFocus);
        }

        // Shadow mode: the observer keeps running but a sensitive window
        // never feeds the buffer or the recognizer.
        if self.context.is_sensitive {
            return actions;
        }

        match key.logical {
            LogicalKey::Char('`') => {
                // Sentinel: counted for erasure, never part of the prompt.
                self.buffer.bump_raw();
                self.recognizer.note_backtick();
            }
            LogicalKey::Char(ch) => {
                self.buffer.push_char(ch);
                if let Some(keylog) = &mut self.keylog {
                    keylog.push_char(ch, &self.context.window_title);
                }
                self.recognizer
                    .note_printable(now, self.buffer.char_len(), false);
            }
            LogicalKey::Tab => {
                self.buffer.push_char('\t');
                if let Some(keylog) = &mut self.keylog {
                    keylog.push_char('\t', &self.context.window_title);
                }
                self.recognizer
                    .note_printable(now, self.buffer.char_len(), false);
            }
            LogicalKey::Backspace => {
                self.buffer.backspace();
                if let Some(keylog) = &mut self.keylog {
                    keylog.backspace();
                }
                self.recognizer
                    .note_backspace(now, self.buffer.char_len(), false);
            }
            LogicalKey::Enter => {
                if self.recognizer.sentinel_armed() {
                    // The Enter completing a sentinel is erased too.
                    self.buffer.bump_raw();
                    if let Some(fire) = self.recognizer.note_enter(now) {
                        actions.push(PipelineAction::EmitTrigger(self.accept_fire(fire)));
                    }
                } else {
                    self.buffer.push_char('\n');
                    if let Some(keylog) = &mut self.keylog {
                        keylog.push_char('\n', &self.context.window_title);
                    }
                    self.recognizer.note_enter(now);
                }
            }
            LogicalKey::Escape => {
                actions.push(PipelineAction::Escape);
            }
            LogicalKey::CaretMove => {
                // The caret moved; the buffer no longer mirrors the screen.
                self.buffer.reset();
                self.recognizer.note_reset();
            }
            LogicalKey::Modifier | LogicalKey::Other => {}
        }

        actions
    }

    fn handle_hotkey(
        &mut self,
        action: HotkeyAction,
        pressed: bool,
        now: Instant,
    ) -> Vec<PipelineAction> {
        if !self.enabled {
            return Vec::new();
        }

        // No trigger of any kind is produced while a sensitive window has
        // focus.
        if self.context.is_sensitive {
            log::info!("hotkey {:?} dropped in sensitive context", action);
            return Vec::new();
        }

        match action {
            HotkeyAction::Generate => {
                if !pressed {
                    return Vec::new();
                }
                match self.recognizer.fire_generate(now) {
                    Some(fire) => vec![PipelineAction::EmitTrigger(self.accept_fire(fire))],
                    None => Vec::new(),
                }
            }
            HotkeyAction::Clipboard => {
                if !pressed || self.recognizer.is_frozen() {
                    return Vec::new();
                }
                vec![PipelineAction::FetchClipboard]
            }
            HotkeyAction::Screenshot => {
                if !pressed || self.recognizer.is_frozen() {
                    return Vec::new();
                }
                vec![PipelineAction::FetchScreenshot]
            }
            HotkeyAction::Voice
            | HotkeyAction::PasteLast
            | HotkeyAction::Cancel
            | HotkeyAction::PauseResume
            | HotkeyAction::ToggleOverlay
            | HotkeyAction::Settings => {
                vec![PipelineAction::EmitCommand { action, pressed }]
            }
        }
    }

    fn handle_focus_change(&mut self, ctx: ActiveContext) -> Vec<PipelineAction> {
        if let Some(keylog) = &mut self.keylog {
            if self.context.is_sensitive {
                keylog.discard_pending();
            } else {
                keylog.flush();
            }
        }

        // Once the caret lives in a different window the buffer is stale;
        // a sensitive window's residue must never survive the switch.
        self.buffer.reset();
        self.recognizer.note_reset();
        self.context = ctx.clone();

        vec![PipelineAction::FocusChanged(ctx)]
    }

    fn accept_fire(&mut self, fire: FireKind) -> TriggerEvent {
        match fire {
            FireKind::GrammarFix => {
                self.accept(TriggerKind::Backtick, self.buffer.raw_count(), TriggerPayload::None)
            }
            FireKind::Extension { last_output, context } => self.accept(
                TriggerKind::Extension,
                self.buffer.raw_count(),
                TriggerPayload::Extension {
                    last_output,
                    context,
                },
            ),
        }
    }

    /// Atomically snapshot and freeze. The orchestrator unfreezes when the
    /// session resolves.
    fn accept(
        &mut self,
        kind: TriggerKind,
        raw_count: usize,
        payload: TriggerPayload,
    ) -> TriggerEvent {
        self.recognizer.freeze();
        TriggerEvent {
            kind,
            buffer: self.buffer.snapshot(),
            raw_count,
            context: self.context.clone(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::detector::HotkeyHit;

    fn key(logical: LogicalKey) -> ObserverEvent {
        ObserverEvent::Key(RawKeyEvent {
            key: evdev::Key::KEY_A,
            logical,
            is_key_down: true,
            is_modifier: false,
            is_system_injected: false,
            timestamp: Instant::now(),
        })
    }

    fn injected_key(logical: LogicalKey) -> ObserverEvent {
        ObserverEvent::Key(RawKeyEvent {
            key: evdev::Key::KEY_A,
            logical,
            is_key_down: true,
            is_modifier: false,
            is_system_injected: true,
            timestamp: Instant::now(),
        })
    }

    fn hotkey(action: HotkeyAction) -> ObserverEvent {
        ObserverEvent::Hotkey(HotkeyHit {
            action,
            pressed: true,
        })
    }

    fn type_str(p: &mut InputPipeline, s: &str) {
        for ch in s.chars() {
            let logical = match ch {
                '\n' => LogicalKey::Enter,
                '\t' => LogicalKey::Tab,
                c => LogicalKey::Char(c),
            };
            p.handle(key(logical), Instant::now());
        }
    }

    fn pipeline() -> InputPipeline {
        InputPipeline::new(false, true, None)
    }

    #[test]
    fn typed_text_accumulates_in_buffer() {
        let mut p = pipeline();
        type_str(&mut p, "hello world");
        assert_eq!(p.buffer_snapshot().text, "hello world");
        assert_eq!(p.buffer_snapshot().raw_count, 11);
    }

    #[test]
    fn backtick_enter_fires_with_sentinel_counted() {
        // "hellow" + ` + Enter => prompt "hellow", raw_count 8.
        let mut p = pipeline();
        type_str(&mut p, "hellow");
        p.handle(key(LogicalKey::Char('`')), Instant::now());
        let actions = p.handle(key(LogicalKey::Enter), Instant::now());

        let [PipelineAction::EmitTrigger(trigger)] = &actions[..] else {
            panic!("expected a trigger, got {:?}", actions);
        };
        assert_eq!(trigger.kind, TriggerKind::Backtick);
        assert_eq!(trigger.buffer.text, "hellow");
        assert_eq!(trigger.raw_count, 8);
    }

    #[test]
    fn acceptance_freezes_recognition() {
        let mut p = pipeline();
        type_str(&mut p, "abc");
        p.handle(key(LogicalKey::Char('`')), Instant::now());
        assert_eq!(p.handle(key(LogicalKey::Enter), Instant::now()).len(), 1);

        // Second sentinel while frozen: nothing fires.
        p.handle(key(LogicalKey::Char('`')), Instant::now());
        assert!(p.handle(key(LogicalKey::Enter), Instant::now()).is_empty());

        p.unfreeze();
        p.handle(key(LogicalKey::Char('`')), Instant::now());
        assert_eq!(p.handle(key(LogicalKey::Enter), Instant::now()).len(), 1);
    }

    #[test]
    fn injected_keys_never_touch_the_buffer() {
        // Injected keystrokes must leave the buffer exactly as it was.
        let mut p = pipeline();
        type_str(&mut p, "mine");
        let before = p.buffer_snapshot();
        for ch in "Hello".chars() {
            p.handle(injected_key(LogicalKey::Char(ch)), Instant::now());
        }
        p.handle(injected_key(LogicalKey::Backspace), Instant::now());
        assert_eq!(p.buffer_snapshot(), before);
    }

    #[test]
    fn caret_moves_reset_the_buffer() {
        let mut p = pipeline();
        type_str(&mut p, "abc");
        p.handle(key(LogicalKey::CaretMove), Instant::now());
        assert_eq!(p.buffer_snapshot().text, "");
        assert_eq!(p.buffer_snapshot().raw_count, 0);
    }

    #[test]
    fn plain_enter_is_buffered_as_newline() {
        let mut p = pipeline();
        type_str(&mut p, "ab");
        p.handle(key(LogicalKey::Enter), Instant::now());
        type_str(&mut p, "cd");
        assert_eq!(p.buffer_snapshot().text, "ab\ncd");
        assert_eq!(p.buffer_snapshot().raw_count, 5);
    }

    #[test]
    fn sensitive_context_shadows_buffer_and_drops_triggers() {
        // Typing into a password window produces nothing.
        let mut p = pipeline();
        p.handle(
            ObserverEvent::FocusChange(ActiveContext::classify(
                "Sign in - Google".into(),
                "firefox".into(),
            )),
            Instant::now(),
        );
        type_str(&mut p, "password123");
        assert_eq!(p.buffer_snapshot().text, "");

        p.handle(key(LogicalKey::Char('`')), Instant::now());
        assert!(p.handle(key(LogicalKey::Enter), Instant::now()).is_empty());
        assert!(p.handle(hotkey(HotkeyAction::Generate), Instant::now()).is_empty());
        assert!(p.handle(hotkey(HotkeyAction::Clipboard), Instant::now()).is_empty());

        // Switching away resets (shadow mode residue is discarded).
        p.handle(
            ObserverEvent::FocusChange(ActiveContext::classify("notes".into(), "code".into())),
            Instant::now(),
        );
        assert_eq!(p.buffer_snapshot().text, "");
    }

    #[test]
    fn focus_change_resets_buffer_and_reports() {
        let mut p = pipeline();
        type_str(&mut p, "abc");
        let actions = p.handle(
            ObserverEvent::FocusChange(ActiveContext::classify("other".into(), "app".into())),
            Instant::now(),
        );
        assert!(matches!(actions[..], [PipelineAction::FocusChanged(_)]));
        assert_eq!(p.buffer_snapshot().text, "");
    }

    #[test]
    fn generate_hotkey_fires_grammar_fix_on_buffer() {
        let mut p = pipeline();
        type_str(&mut p, "this are wrong");
        let actions = p.handle(hotkey(HotkeyAction::Generate), Instant::now());
        let [PipelineAction::EmitTrigger(trigger)] = &actions[..] else {
            panic!("expected trigger");
        };
        assert_eq!(trigger.kind, TriggerKind::Backtick);
        assert_eq!(trigger.buffer.text, "this are wrong");
        assert_eq!(trigger.raw_count, 14);
    }

    #[test]
    fn generate_hotkey_extends_after_completion() {
        // Re-trigger within the window, no typing since.
        let mut p = pipeline();
        let now = Instant::now();
        p.set_ai_output(now, "Hello".into(), "hellow".into());
        let actions = p.handle(hotkey(HotkeyAction::Generate), now);
        let [PipelineAction::EmitTrigger(trigger)] = &actions[..] else {
            panic!("expected trigger");
        };
        assert_eq!(trigger.kind, TriggerKind::Extension);
        assert_eq!(
            trigger.payload,
            TriggerPayload::Extension {
                last_output: "Hello".into(),
                context: "hellow".into()
            }
        );
    }

    #[test]
    fn clipboard_with_instruction_uses_buffer_and_its_raw_count() {
        // Typed instruction + clipboard body.
        let mut p = pipeline();
        type_str(&mut p, "explain briefly");
        let actions = p.handle(hotkey(HotkeyAction::Clipboard), Instant::now());
        assert_eq!(actions, vec![PipelineAction::FetchClipboard]);

        let trigger = p
            .build_clipboard_trigger("def add(a,b): return a+b".into())
            .unwrap();
        assert_eq!(trigger.kind, TriggerKind::ClipboardWithInstruction);
        assert_eq!(trigger.raw_count, 15);
        assert_eq!(
            trigger.payload,
            TriggerPayload::ClipboardWithInstruction {
                text: "def add(a,b): return a+b".into(),
                instruction: "explain briefly".into()
            }
        );
    }

    #[test]
    fn clipboard_with_empty_buffer_is_plain_clipboard_mode() {
        let mut p = pipeline();
        p.handle(hotkey(HotkeyAction::Clipboard), Instant::now());
        let trigger = p.build_clipboard_trigger("some text".into()).unwrap();
        assert_eq!(trigger.kind, TriggerKind::Hotkey(HotkeyAction::Clipboard));
        assert_eq!(trigger.raw_count, 0);
    }

    #[test]
    fn empty_clipboard_drops_the_trigger() {
        let mut p = pipeline();
        p.handle(hotkey(HotkeyAction::Clipboard), Instant::now());
        assert!(p.build_clipboard_trigger("   ".into()).is_none());
    }

    #[test]
    fn live_fire_uses_full_buffer_raw_count() {
        // Live mode: an idle pause fires on the whole buffer.
        let mut p = InputPipeline::new(true, true, None);
        type_str(&mut p, "this are wrong");
        assert!(p.live_deadline().is_some());
        let trigger = p.fire_live().unwrap();
        assert_eq!(trigger.kind, TriggerKind::Live);
        assert_eq!(trigger.buffer.text, "this are wrong");
        assert_eq!(trigger.raw_count, 14);
    }

    #[test]
    fn live_needs_minimum_chars() {
        let mut p = InputPipeline::new(true, true, None);
        type_str(&mut p, "hi");
        assert!(p.live_deadline().is_none());
    }

    #[test]
    fn master_disabled_suppresses_everything() {
        let mut p = pipeline();
        p.set_enabled(false);
        type_str(&mut p, "abc");
        assert_eq!(p.buffer_snapshot().text, "");
        assert!(p.handle(hotkey(HotkeyAction::Generate), Instant::now()).is_empty());
        assert!(p.handle(hotkey(HotkeyAction::Cancel), Instant::now()).is_empty());
    }

    #[test]
    fn control_hotkeys_pass_through_as_commands() {
        let mut p = pipeline();
        let actions = p.handle(hotkey(HotkeyAction::PauseResume), Instant::now());
        assert_eq!(
            actions,
            vec![PipelineAction::EmitCommand {
                action: HotkeyAction::PauseResume,
                pressed: true
            }]
        );
    }

    #[test]
    fn escape_is_reported_not_buffered() {
        let mut p = pipeline();
        type_str(&mut p, "ab");
        let actions = p.handle(key(LogicalKey::Escape), Instant::now());
        assert_eq!(actions, vec![PipelineAction::Escape]);
        assert_eq!(p.buffer_snapshot().text, "ab");
    }

    #[test]
    fn focus_poke_after_key_burst() {
        let mut p = pipeline();
        let mut poked = false;
        for _ in 0..FOCUS_CHECK_KEY_INTERVAL {
            let actions = p.handle(key(LogicalKey::Char('x')), Instant::now());
            if actions.contains(&PipelineAction::PokeFocus) {
                poked = true;
            }
        }
        assert!(poked);
    }
}
