//! End-to-end scenarios: the input pipeline feeding the orchestrator, with
//! a recording effect runner standing in for the worker, injector, and
//! popup surfaces.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use keyflow::config::{Settings, SettingsHandle};
use keyflow::observer::detector::{HotkeyAction, HotkeyHit};
use keyflow::observer::keymap::LogicalKey;
use keyflow::observer::{ActiveContext, ObserverEvent, RawKeyEvent};
use keyflow::orchestrator::{
    Effect, EffectRunner, Event, Orchestrator, OrchestratorMsg, Phase,
};
use keyflow::pipeline::{InputPipeline, PipelineAction};
use uuid::Uuid;

/// Records effects; the test script plays the other processes.
struct RecordingRunner {
    effects: Mutex<Vec<Effect>>,
}

impl RecordingRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            effects: Mutex::new(Vec::new()),
        })
    }

    fn drain(&self) -> Vec<Effect> {
        std::mem::take(&mut *self.effects.lock().unwrap())
    }
}

impl EffectRunner for RecordingRunner {
    fn run(&self, effect: Effect, _tx: tokio::sync::mpsc::Sender<Event>) {
        self.effects.lock().unwrap().push(effect);
    }
}

struct Harness {
    pipeline: InputPipeline,
    orch: Orchestrator,
    runner: Arc<RecordingRunner>,
    settings: SettingsHandle,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(settings: Settings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let handle = SettingsHandle::new(settings.clone(), dir.path().join("settings.json"));
        let runner = RecordingRunner::new();
        let (mut orch, _tx, _rx) = Orchestrator::new(runner.clone(), handle.clone(), 256);
        orch.handle(OrchestratorMsg::WorkerAvailability(true));
        Self {
            pipeline: InputPipeline::new(settings.live_mode, settings.master_enabled, None),
            orch,
            runner,
            settings: handle,
            _dir: dir,
        }
    }

    fn key(&mut self, logical: LogicalKey) {
        let event = ObserverEvent::Key(RawKeyEvent {
            key: evdev::Key::KEY_A,
            logical,
            is_key_down: true,
            is_modifier: false,
            is_system_injected: false,
            timestamp: Instant::now(),
        });
        for action in self.pipeline.handle(event, Instant::now()) {
            self.dispatch(action);
        }
    }

    fn type_str(&mut self, text: &str) {
        for ch in text.chars() {
            let logical = match ch {
                '\n' => LogicalKey::Enter,
                '\t' => LogicalKey::Tab,
                c => LogicalKey::Char(c),
            };
            self.key(logical);
        }
    }

    fn hotkey(&mut self, action: HotkeyAction) {
        let event = ObserverEvent::Hotkey(HotkeyHit {
            action,
            pressed: true,
        });
        for action in self.pipeline.handle(event, Instant::now()) {
            self.dispatch(action);
        }
    }

    fn focus(&mut self, title: &str, process: &str) {
        let event =
            ObserverEvent::FocusChange(ActiveContext::classify(title.into(), process.into()));
        for action in self.pipeline.handle(event, Instant::now()) {
            self.dispatch(action);
        }
    }

    /// Wire pipeline actions into the mailbox the way the daemon does,
    /// with the clipboard played by the test.
    fn dispatch(&mut self, action: PipelineAction) {
        match action {
            PipelineAction::EmitTrigger(trigger) => {
                self.orch
                    .handle(OrchestratorMsg::Machine(Event::Trigger(trigger)));
            }
            PipelineAction::EmitCommand { action, pressed } => match action {
                HotkeyAction::PasteLast if pressed => {
                    self.orch.handle(OrchestratorMsg::Machine(Event::PasteHotkey));
                }
                HotkeyAction::Cancel if pressed => {
                    self.orch
                        .handle(OrchestratorMsg::Machine(Event::CancelRequested));
                }
                HotkeyAction::PauseResume if pressed => {
                    self.orch.handle(OrchestratorMsg::PauseToggle);
                }
                _ => {}
            },
            PipelineAction::Escape => {
                self.orch
                    .handle(OrchestratorMsg::Machine(Event::CancelRequested));
            }
            PipelineAction::FocusChanged(_) => {
                self.orch.handle(OrchestratorMsg::Machine(Event::FocusChanged));
            }
            PipelineAction::FetchClipboard | PipelineAction::FetchScreenshot => {
                panic!("clipboard/screenshot must be played explicitly in tests");
            }
            PipelineAction::PokeFocus => {}
        }
    }

    fn paste_clipboard(&mut self, clipboard: &str) {
        let actions = self.pipeline.handle(
            ObserverEvent::Hotkey(HotkeyHit {
                action: HotkeyAction::Clipboard,
                pressed: true,
            }),
            Instant::now(),
        );
        assert_eq!(actions, vec![PipelineAction::FetchClipboard]);
        if let Some(trigger) = self.pipeline.build_clipboard_trigger(clipboard.into()) {
            self.orch
                .handle(OrchestratorMsg::Machine(Event::Trigger(trigger)));
        }
    }

    /// The dispatched request's correlation id.
    fn session_id(&self) -> Uuid {
        self.orch.phase().session().expect("active session").id
    }

    fn chunk(&mut self, id: Uuid, text: &str, is_final: bool) {
        self.orch.handle(OrchestratorMsg::Machine(Event::Chunk {
            id,
            text: text.into(),
            is_final,
            explanation: None,
        }));
    }

    /// Apply recorded effects the way the daemon's wiring would, feeding
    /// buffer commands back into the pipeline. Returns what was drained.
    fn settle(&mut self) -> Vec<Effect> {
        let effects = self.runner.drain();
        for effect in &effects {
            match effect {
                Effect::ResetBuffer => self.pipeline.reset_buffer(),
                Effect::UnfreezeTriggers => self.pipeline.unfreeze(),
                Effect::SetAiOutput { output, context } => {
                    self.pipeline
                        .set_ai_output(Instant::now(), output.clone(), context.clone());
                }
                _ => {}
            }
        }
        effects
    }

    fn inject_finished(&mut self, id: Uuid) {
        self.orch
            .handle(OrchestratorMsg::Machine(Event::InjectFinished { id, error: None }));
    }
}

fn find_inject(effects: &[Effect]) -> Option<(Uuid, String, usize)> {
    effects.iter().find_map(|e| match e {
        Effect::Inject {
            id,
            text,
            backspaces,
            ..
        } => Some((*id, text.clone(), *backspaces)),
        _ => None,
    })
}

#[tokio::test]
async fn backtick_grammar_fix_with_manual_paste() {
    let mut h = Harness::new(Settings::default());

    h.type_str("hellow");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);

    // Trigger dispatched with the sentinel counted for erasure.
    let effects = h.settle();
    let dispatched = effects
        .iter()
        .find_map(|e| match e {
            Effect::Dispatch(req) => Some(req.clone()),
            _ => None,
        })
        .expect("dispatch");
    assert_eq!(dispatched.prompt, "hellow");
    let session = h.orch.phase().session().unwrap();
    assert_eq!(session.pending_backspace_count, 8);
    let id = session.id;

    // Worker streams "Hello" over two chunks, then final.
    h.chunk(id, "Hel", false);
    h.chunk(id, "lo", false);
    h.chunk(id, "", true);
    let effects = h.settle();
    assert!(matches!(h.orch.phase(), Phase::Presenting { .. }));
    assert!(effects.contains(&Effect::PopupEndStream));
    assert!(effects.contains(&Effect::PersistLastOutput {
        text: "Hello".into(),
        explanation: None
    }));

    // Paste hotkey: 8 backspaces then "Hello".
    h.hotkey(HotkeyAction::PasteLast);
    let effects = h.settle();
    let (inject_id, text, backspaces) = find_inject(&effects).expect("inject");
    assert_eq!(inject_id, id);
    assert_eq!(text, "Hello");
    assert_eq!(backspaces, 8);

    // Injection done: buffer resets, session closes.
    h.inject_finished(id);
    h.settle();
    assert!(matches!(h.orch.phase(), Phase::Idle));
    assert_eq!(h.pipeline.buffer_snapshot().text, "");
    assert_eq!(h.pipeline.buffer_snapshot().raw_count, 0);
    // Last output was consumed.
    assert_eq!(h.settings.snapshot().last_generated_text, "");
}

#[tokio::test]
async fn extension_continues_the_previous_output() {
    let mut h = Harness::new(Settings::default());

    // First generation completes and stays presented.
    h.type_str("hellow");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    let id = h.session_id();
    h.settle();
    h.chunk(id, "Hello", true);
    h.settle();

    // Dismiss the popup (keeps the armed extension window), then
    // re-trigger within 2 s with no typing.
    h.key(LogicalKey::Escape);
    h.settle();
    h.hotkey(HotkeyAction::Generate);
    let effects = h.settle();

    let req = effects
        .iter()
        .find_map(|e| match e {
            Effect::Dispatch(req) => Some(req.clone()),
            _ => None,
        })
        .expect("extension dispatch");
    assert_eq!(
        req.mode,
        keyflow::worker::GenerationMode::Extend
    );
    assert_eq!(req.prompt, "hellow");
    assert_eq!(req.context.last_output.as_deref(), Some("Hello"));
}

#[tokio::test]
async fn extension_after_reset_produces_no_trigger() {
    let mut h = Harness::new(Settings::default());

    h.type_str("hellow");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    let id = h.session_id();
    h.settle();
    h.chunk(id, "Hello", true);
    h.settle();

    // Inject; the buffer resets and the extension context is gone with it.
    h.hotkey(HotkeyAction::PasteLast);
    h.settle();
    h.inject_finished(id);
    h.settle();

    h.hotkey(HotkeyAction::Generate);
    let effects = h.settle();
    assert!(!effects.iter().any(|e| matches!(e, Effect::Dispatch(_))));
    assert!(matches!(h.orch.phase(), Phase::Idle));
}

#[tokio::test]
async fn clipboard_with_instruction_auto_injects() {
    let settings = Settings {
        auto_inject: true,
        ..Settings::default()
    };
    let mut h = Harness::new(settings);

    h.type_str("explain briefly");
    h.paste_clipboard("def add(a,b): return a+b");

    let effects = h.settle();
    let req = effects
        .iter()
        .find_map(|e| match e {
            Effect::Dispatch(req) => Some(req.clone()),
            _ => None,
        })
        .expect("dispatch");
    assert_eq!(
        req.mode,
        keyflow::worker::GenerationMode::ClipboardWithInstruction
    );
    assert_eq!(req.prompt, "def add(a,b): return a+b");
    assert_eq!(req.context.instruction.as_deref(), Some("explain briefly"));

    let id = h.session_id();
    h.chunk(id, "Adds two numbers.", true);
    let effects = h.settle();

    // Auto-inject: no presentation, 15 backspaces erase the instruction.
    let (_, text, backspaces) = find_inject(&effects).expect("inject");
    assert_eq!(text, "Adds two numbers.");
    assert_eq!(backspaces, 15);
    assert!(!effects.iter().any(|e| matches!(e, Effect::PopupShowStream)));
    assert!(matches!(h.orch.phase(), Phase::Injecting { .. }));

    h.inject_finished(id);
    h.settle();
    assert_eq!(h.pipeline.buffer_snapshot().text, "");
}

#[tokio::test]
async fn live_idle_fix_replaces_typed_text() {
    let settings = Settings {
        live_mode: true,
        ..Settings::default()
    };
    let mut h = Harness::new(settings);

    h.type_str("this are wrong");
    assert!(h.pipeline.live_deadline().is_some());

    // The idle deadline elapses.
    let trigger = h.pipeline.fire_live().expect("live trigger");
    assert_eq!(trigger.raw_count, 14);
    h.orch
        .handle(OrchestratorMsg::Machine(Event::Trigger(trigger)));
    let id = h.session_id();
    h.settle();

    h.chunk(id, "This is wrong", true);
    h.settle();
    assert!(matches!(h.orch.phase(), Phase::Presenting { .. }));

    h.hotkey(HotkeyAction::PasteLast);
    let effects = h.settle();
    let (_, text, backspaces) = find_inject(&effects).expect("inject");
    assert_eq!(text, "This is wrong");
    assert_eq!(backspaces, 14);
}

#[tokio::test]
async fn sensitive_window_produces_no_triggers_and_resets_on_leave() {
    let mut h = Harness::new(Settings::default());

    h.focus("HDFC NetBanking - Chrome", "chrome");
    h.settle();
    h.type_str("password123");
    assert_eq!(h.pipeline.buffer_snapshot().text, "");

    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    h.hotkey(HotkeyAction::Generate);
    let effects = h.settle();
    assert!(!effects.iter().any(|e| matches!(e, Effect::Dispatch(_))));

    h.focus("notes.md - VS Code", "code");
    h.settle();
    assert_eq!(h.pipeline.buffer_snapshot().text, "");
    assert!(matches!(h.orch.phase(), Phase::Idle));
}

#[tokio::test]
async fn worker_crash_mid_stream_presents_partial() {
    let mut h = Harness::new(Settings::default());

    h.type_str("hellow");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    let id = h.session_id();
    h.settle();

    h.chunk(id, "Hel", false);
    h.chunk(id, "lo", false);
    // The worker dies without a final chunk.
    h.orch.handle(OrchestratorMsg::Machine(Event::Failed {
        id,
        message: "AI worker stream closed".into(),
    }));

    let effects = h.settle();
    assert!(matches!(h.orch.phase(), Phase::Presenting { .. }));
    assert!(effects.contains(&Effect::PopupEndStream));
    assert!(effects.contains(&Effect::PersistLastOutput {
        text: "Hello".into(),
        explanation: None
    }));

    // Availability drops while the supervisor restarts the worker; new
    // triggers surface the outage instead of dispatching.
    h.orch.handle(OrchestratorMsg::WorkerAvailability(false));
    h.hotkey(HotkeyAction::Cancel);
    h.settle();
    h.type_str("more");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    let effects = h.settle();
    assert!(!effects.iter().any(|e| matches!(e, Effect::Dispatch(_))));
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::PopupShowError { .. })));
}

#[tokio::test]
async fn escape_cancels_and_discards_late_chunks() {
    let mut h = Harness::new(Settings::default());

    h.type_str("some text");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    let id = h.session_id();
    h.settle();
    h.chunk(id, "partial", false);
    h.settle();

    h.key(LogicalKey::Escape);
    let effects = h.settle();
    assert!(matches!(h.orch.phase(), Phase::Idle));
    assert!(effects.contains(&Effect::CancelWorkerRequest { id }));
    assert!(effects.contains(&Effect::PopupHide));

    // Chunks the worker still emits for the canceled id change nothing.
    h.chunk(id, "late", true);
    let effects = h.settle();
    assert!(effects.is_empty());
    assert!(matches!(h.orch.phase(), Phase::Idle));
}

#[tokio::test]
async fn paused_trigger_dispatches_on_resume() {
    let mut h = Harness::new(Settings::default());

    h.hotkey(HotkeyAction::PauseResume);
    h.type_str("fix this");
    h.key(LogicalKey::Char('`'));
    h.key(LogicalKey::Enter);
    h.settle();
    assert!(matches!(h.orch.phase(), Phase::Idle));

    h.hotkey(HotkeyAction::PauseResume);
    let effects = h.settle();
    assert!(effects.iter().any(|e| matches!(e, Effect::Dispatch(_))));
    assert!(matches!(h.orch.phase(), Phase::Dispatching { .. }));
}
