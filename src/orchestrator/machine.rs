//! Session state machine.
//!
//! All transitions go through `reduce()`, which returns the next phase and
//! a list of effects; the runner executes effects asynchronously and feeds
//! completions back as events. Events carrying a correlation id that does
//! not match the current session are stale and dropped silently.

use uuid::Uuid;

use crate::inject::normalize_indent;
use crate::observer::detector::HotkeyAction;
use crate::triggers::{TriggerEvent, TriggerKind, TriggerPayload};
use crate::worker::protocol::{GenerationContext, GenerationMode, GenerationRequest};

/// Per-trigger bookkeeping, created at acceptance, destroyed on
/// completion or cancel.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub mode: GenerationMode,
    pub pending_backspace_count: usize,
    pub accumulated: String,
    pub explanation: Option<String>,
    pub popup_shown: bool,
    pub auto_inject: bool,
    pub humanize: bool,
    /// The prompt as dispatched (extension context for the recognizer).
    pub source_prompt: String,
    /// Original clipboard body, kept for the coding-mode explanation.
    pub source_clipboard: Option<String>,
}

/// Orchestrator phase. One session at a time; injection targets are
/// mutually exclusive so sessions are serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Dispatching { session: Session },
    Streaming { session: Session },
    Presenting { session: Session },
    Injecting { session: Session },
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Idle
    }
}

impl Phase {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Phase::Idle => None,
            Phase::Dispatching { session }
            | Phase::Streaming { session }
            | Phase::Presenting { session }
            | Phase::Injecting { session } => Some(session),
        }
    }
}

/// Everything that can move the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Trigger(TriggerEvent),
    /// The user submitted an instruction in the vision prompt.
    VisionPrompt { instruction: String },
    /// A free-form prompt from the overlay surface.
    FreePrompt { prompt: String },
    Chunk {
        id: Uuid,
        text: String,
        is_final: bool,
        explanation: Option<String>,
    },
    Complete { id: Uuid, text: String },
    Failed { id: Uuid, message: String },
    Timeout { id: Uuid },
    InjectFinished { id: Uuid, error: Option<String> },
    PasteHotkey,
    CancelRequested,
    FocusChanged,
}

/// Effects executed by the runner after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Dispatch(GenerationRequest),
    /// Coding mode: explain the generated code in a side window.
    DispatchExplanation { clipboard: String, code: String },
    StartTimeout { id: Uuid },
    CancelWorkerRequest { id: Uuid },
    PopupShowStream,
    PopupAppend { text: String },
    PopupEndStream,
    PopupShowComplete { text: String },
    PopupShowError { message: String },
    PopupHide,
    PopupShowVisionPrompt,
    Inject {
        id: Uuid,
        text: String,
        backspaces: usize,
        humanize: bool,
    },
    ResetBuffer,
    UnfreezeTriggers,
    /// Arm the recognizer's extension window.
    SetAiOutput { output: String, context: String },
    PersistLastOutput {
        text: String,
        explanation: Option<String>,
    },
    ClearLastOutput,
}

/// Settings view the reducer needs at transition time.
#[derive(Debug, Clone, Default)]
pub struct ReduceCtx {
    pub auto_inject: bool,
    pub humanize: bool,
    pub coding_mode: bool,
    pub worker_available: bool,
    pub tone: String,
    pub last_generated_text: String,
}

pub fn reduce(phase: &Phase, event: Event, ctx: &ReduceCtx) -> (Phase, Vec<Effect>) {
    use Effect::*;

    let current_id = phase.session().map(|s| s.id);
    let is_stale = |eid: Uuid| current_id != Some(eid);

    match (phase, event) {
        // -----------------
        // Idle
        // -----------------
        (Phase::Idle, Event::Trigger(trigger)) => accept_trigger(trigger, ctx),

        (Phase::Idle, Event::VisionPrompt { instruction }) => {
            if !ctx.worker_available {
                return (Phase::Idle, vec![worker_unavailable_error()]);
            }
            let req = GenerationRequest::new(
                GenerationMode::Vision,
                instruction,
                GenerationContext::default(),
            );
            dispatch(req, None, 0, ctx)
        }

        (Phase::Idle, Event::FreePrompt { prompt }) => {
            if !ctx.worker_available {
                return (Phase::Idle, vec![worker_unavailable_error()]);
            }
            let req = GenerationRequest::new(
                GenerationMode::FreePrompt,
                prompt,
                GenerationContext {
                    tone: Some(ctx.tone.clone()),
                    ..Default::default()
                },
            );
            dispatch(req, None, 0, ctx)
        }

        (Phase::Idle, Event::PasteHotkey) => {
            if ctx.last_generated_text.is_empty() {
                return (Phase::Idle, vec![]);
            }
            // Re-type the unconsumed last result; nothing to erase.
            let text = normalize_indent(&ctx.last_generated_text);
            let session = Session {
                id: Uuid::new_v4(),
                mode: GenerationMode::FreePrompt,
                pending_backspace_count: 0,
                accumulated: text.clone(),
                explanation: None,
                popup_shown: false,
                auto_inject: false,
                humanize: ctx.humanize,
                source_prompt: String::new(),
                source_clipboard: None,
            };
            let effects = vec![
                PopupHide,
                Inject {
                    id: session.id,
                    text,
                    backspaces: 0,
                    humanize: ctx.humanize,
                },
                ResetBuffer,
            ];
            (Phase::Injecting { session }, effects)
        }

        (Phase::Idle, Event::CancelRequested) => (
            Phase::Idle,
            vec![PopupHide, ClearLastOutput, UnfreezeTriggers],
        ),

        // -----------------
        // Dispatching
        // -----------------
        (Phase::Dispatching { session }, Event::Chunk { id, text, is_final, explanation })
            if session.id == id =>
        {
            let mut session = session.clone();
            session.accumulated.push_str(&text);
            if let Some(explanation) = explanation {
                session.explanation = Some(explanation);
            }
            if is_final {
                return finish(session, ctx);
            }
            let mut effects = Vec::new();
            if !session.auto_inject {
                session.popup_shown = true;
                effects.push(PopupShowStream);
                effects.push(PopupAppend { text });
            }
            (Phase::Streaming { session }, effects)
        }

        (Phase::Dispatching { session }, Event::Complete { id, text }) if session.id == id => {
            let mut session = session.clone();
            session.accumulated = text;
            finish(session, ctx)
        }

        (Phase::Dispatching { session }, Event::Failed { id, message }) if session.id == id => (
            Phase::Idle,
            vec![
                PopupShowError { message },
                UnfreezeTriggers,
            ],
        ),

        (Phase::Dispatching { session }, Event::Timeout { id }) if session.id == id => (
            Phase::Idle,
            vec![
                CancelWorkerRequest { id },
                PopupShowError {
                    message: "Generation timed out".into(),
                },
                UnfreezeTriggers,
            ],
        ),

        (Phase::Dispatching { session }, Event::CancelRequested) => cancel_active(session),

        // -----------------
        // Streaming
        // -----------------
        (Phase::Streaming { session }, Event::Chunk { id, text, is_final, explanation })
            if session.id == id =>
        {
            let mut session = session.clone();
            session.accumulated.push_str(&text);
            if let Some(explanation) = explanation {
                session.explanation = Some(explanation);
            }
            if is_final {
                return finish(session, ctx);
            }
            let effects = if session.popup_shown {
                vec![PopupAppend { text }]
            } else {
                vec![]
            };
            (Phase::Streaming { session }, effects)
        }

        (Phase::Streaming { session }, Event::Failed { id, message }) if session.id == id => {
            if session.accumulated.is_empty() {
                (
                    Phase::Idle,
                    vec![PopupShowError { message }, UnfreezeTriggers],
                )
            } else {
                // Partial accumulation is a recoverable result.
                log::warn!("stream failed with partial data ({}), presenting partial", message);
                finish(session.clone(), ctx)
            }
        }

        (Phase::Streaming { session }, Event::Timeout { id }) if session.id == id => {
            if session.accumulated.is_empty() {
                (
                    Phase::Idle,
                    vec![
                        CancelWorkerRequest { id },
                        PopupShowError {
                            message: "Generation timed out".into(),
                        },
                        UnfreezeTriggers,
                    ],
                )
            } else {
                let mut effects = vec![CancelWorkerRequest { id }];
                let (phase, mut finish_effects) = finish(session.clone(), ctx);
                effects.append(&mut finish_effects);
                (phase, effects)
            }
        }

        (Phase::Streaming { session }, Event::CancelRequested) => cancel_active(session),

        // -----------------
        // Presenting
        // -----------------
        (Phase::Presenting { session }, Event::PasteHotkey) => {
            let mut session = session.clone();
            // Indent normalization happens exactly once per session; the
            // auto-inject path never reaches Presenting.
            let text = normalize_indent(&session.accumulated);
            session.accumulated = text.clone();
            let effects = vec![
                PopupHide,
                Inject {
                    id: session.id,
                    text,
                    backspaces: session.pending_backspace_count,
                    humanize: session.humanize,
                },
                ResetBuffer,
            ];
            (Phase::Injecting { session }, effects)
        }

        (Phase::Presenting { .. }, Event::CancelRequested) => (
            Phase::Idle,
            vec![PopupHide, ClearLastOutput, UnfreezeTriggers],
        ),

        (Phase::Presenting { .. }, Event::FocusChanged) => {
            // The popup self-hides; the result stays consumable via
            // Paste-last.
            (Phase::Idle, vec![PopupHide, UnfreezeTriggers])
        }

        // -----------------
        // Injecting
        // -----------------
        (Phase::Injecting { session }, Event::InjectFinished { id, error: None })
            if session.id == id =>
        {
            (
                Phase::Idle,
                vec![ResetBuffer, ClearLastOutput, UnfreezeTriggers],
            )
        }

        (Phase::Injecting { session }, Event::InjectFinished { id, error: Some(message) })
            if session.id == id =>
        {
            // The generated text is kept for retry; tell the user where
            // things stand.
            let mut session = session.clone();
            session.popup_shown = true;
            (
                Phase::Presenting { session },
                vec![PopupShowError {
                    message: format!("Injection failed: {}", message),
                }],
            )
        }

        // -----------------
        // Stale correlation ids: drop silently.
        // -----------------
        (_, Event::Chunk { id, .. }) if is_stale(id) => (phase.clone(), vec![]),
        (_, Event::Complete { id, .. }) if is_stale(id) => (phase.clone(), vec![]),
        (_, Event::Failed { id, .. }) if is_stale(id) => (phase.clone(), vec![]),
        (_, Event::Timeout { id }) if is_stale(id) => (phase.clone(), vec![]),
        (_, Event::InjectFinished { id, .. }) if is_stale(id) => (phase.clone(), vec![]),

        // -----------------
        // Everything else: no transition.
        // -----------------
        _ => (phase.clone(), vec![]),
    }
}

fn worker_unavailable_error() -> Effect {
    Effect::PopupShowError {
        message: "AI worker is unavailable; check configuration".into(),
    }
}

/// Map an accepted trigger onto a generation request and enter
/// Dispatching. Triggers that cannot produce a request resolve
/// immediately (unfreeze, optional message).
fn accept_trigger(trigger: TriggerEvent, ctx: &ReduceCtx) -> (Phase, Vec<Effect>) {
    use Effect::*;

    // The vision flow needs an instruction first; the prompt popup takes
    // focus and reports back via Event::VisionPrompt.
    if trigger.kind == TriggerKind::Hotkey(HotkeyAction::Screenshot) {
        return (
            Phase::Idle,
            vec![PopupShowVisionPrompt, UnfreezeTriggers],
        );
    }

    if !ctx.worker_available {
        return (
            Phase::Idle,
            vec![worker_unavailable_error(), UnfreezeTriggers],
        );
    }

    let (request, clipboard) = match build_request(&trigger) {
        Some(built) => built,
        None => return (Phase::Idle, vec![UnfreezeTriggers]),
    };

    dispatch(request, clipboard, trigger.raw_count, ctx)
}

fn dispatch(
    request: GenerationRequest,
    clipboard: Option<String>,
    raw_count: usize,
    ctx: &ReduceCtx,
) -> (Phase, Vec<Effect>) {
    let session = Session {
        id: request.id,
        mode: request.mode,
        pending_backspace_count: raw_count,
        accumulated: String::new(),
        explanation: None,
        popup_shown: false,
        auto_inject: ctx.auto_inject,
        humanize: ctx.humanize,
        source_prompt: request.prompt.clone(),
        source_clipboard: clipboard,
    };
    let effects = vec![
        Effect::Dispatch(request),
        Effect::StartTimeout { id: session.id },
    ];
    (Phase::Dispatching { session }, effects)
}

/// Trigger -> request. None drops the trigger (empty prompt, nothing to
/// extend).
fn build_request(trigger: &TriggerEvent) -> Option<(GenerationRequest, Option<String>)> {
    match (&trigger.kind, &trigger.payload) {
        (TriggerKind::Backtick | TriggerKind::Live, _) => {
            if trigger.buffer.text.trim().is_empty() {
                return None;
            }
            let req = GenerationRequest::new(
                GenerationMode::GrammarFix,
                trigger.buffer.text.clone(),
                GenerationContext::default(),
            );
            Some((req, None))
        }
        (
            TriggerKind::Extension,
            TriggerPayload::Extension {
                last_output,
                context,
            },
        ) => {
            if last_output.is_empty() {
                return None;
            }
            // The prompt is the buffer as it stands; post-injection resets
            // leave it empty and the original context carries the thread.
            let prompt = if trigger.buffer.text.is_empty() {
                context.clone()
            } else {
                trigger.buffer.text.clone()
            };
            if prompt.is_empty() {
                return None;
            }
            let req = GenerationRequest::new(
                GenerationMode::Extend,
                prompt,
                GenerationContext {
                    last_output: Some(last_output.clone()),
                    ..Default::default()
                },
            );
            Some((req, None))
        }
        (
            TriggerKind::ClipboardWithInstruction,
            TriggerPayload::ClipboardWithInstruction { text, instruction },
        ) => {
            let req = GenerationRequest::new(
                GenerationMode::ClipboardWithInstruction,
                text.clone(),
                GenerationContext {
                    instruction: Some(instruction.clone()),
                    ..Default::default()
                },
            );
            Some((req, Some(text.clone())))
        }
        (
            TriggerKind::Hotkey(HotkeyAction::Clipboard),
            TriggerPayload::Clipboard { text },
        ) => {
            let req = GenerationRequest::new(
                GenerationMode::Clipboard,
                text.clone(),
                GenerationContext::default(),
            );
            Some((req, Some(text.clone())))
        }
        _ => {
            log::debug!("trigger {:?} produced no request", trigger.kind);
            None
        }
    }
}

/// The generation finished (final chunk, one-shot complete, or accepted
/// partial). Decide between presenting and auto-injecting.
fn finish(session: Session, ctx: &ReduceCtx) -> (Phase, Vec<Effect>) {
    use Effect::*;

    if session.accumulated.trim().is_empty() {
        return (
            Phase::Idle,
            vec![
                PopupShowError {
                    message: "The model returned an empty response".into(),
                },
                UnfreezeTriggers,
            ],
        );
    }

    let mut effects = Vec::new();

    // Coding mode: explain clipboard-family generations in parallel, in a
    // side window, never injectable.
    if ctx.coding_mode
        && matches!(
            session.mode,
            GenerationMode::Clipboard | GenerationMode::ClipboardWithInstruction
        )
    {
        if let Some(clipboard) = &session.source_clipboard {
            effects.push(DispatchExplanation {
                clipboard: clipboard.clone(),
                code: session.accumulated.clone(),
            });
        }
    }

    if session.auto_inject {
        let mut session = session;
        let text = normalize_indent(&session.accumulated);
        session.accumulated = text.clone();
        effects.extend([
            Inject {
                id: session.id,
                text,
                backspaces: session.pending_backspace_count,
                humanize: session.humanize,
            },
            ResetBuffer,
        ]);
        return (Phase::Injecting { session }, effects);
    }

    let text = session.accumulated.clone();
    if session.popup_shown {
        effects.push(PopupEndStream);
    } else {
        effects.push(PopupShowComplete { text: text.clone() });
    }
    effects.push(SetAiOutput {
        output: text.clone(),
        context: session.source_prompt.clone(),
    });
    effects.push(PersistLastOutput {
        text,
        explanation: session.explanation.clone(),
    });

    let mut session = session;
    session.popup_shown = true;
    (Phase::Presenting { session }, effects)
}

fn cancel_active(session: &Session) -> (Phase, Vec<Effect>) {
    use Effect::*;
    (
        Phase::Idle,
        vec![
            CancelWorkerRequest { id: session.id },
            PopupHide,
            ClearLastOutput,
            UnfreezeTriggers,
        ],
    )
}
