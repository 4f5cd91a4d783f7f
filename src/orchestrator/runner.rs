//! Effect execution.
//!
//! The state machine stays pure; this runner owns the side effects and
//! feeds their completions back into the mailbox as events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::config::SettingsHandle;
use crate::inject::{InjectionRequest, InjectorClient};
use crate::popup::PopupController;
use crate::worker::protocol::{GenerationContext, GenerationMode, GenerationRequest};
use crate::worker::{StreamUpdate, WorkerClient};

use super::machine::{Effect, Event};

/// A session with no chunk for this long has failed (partials resolve as
/// recoverable results).
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands the orchestrator sends back to the input task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    ResetBuffer,
    Unfreeze,
    SetAiOutput { output: String, context: String },
    SetLiveMode(bool),
    SetEnabled(bool),
    ClearKeylog,
}

/// Runs effects asynchronously; completions come back via the event
/// channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn run(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// The production runner, wired to the worker slot, the injector, the
/// popup controller, the input task, and the settings handler.
pub struct DaemonEffectRunner {
    worker: Arc<Mutex<Option<WorkerClient>>>,
    injector: Arc<InjectorClient>,
    popup: Arc<PopupController>,
    input_tx: mpsc::Sender<InputCommand>,
    settings: SettingsHandle,
}

impl DaemonEffectRunner {
    pub fn new(
        worker: Arc<Mutex<Option<WorkerClient>>>,
        injector: Arc<InjectorClient>,
        popup: Arc<PopupController>,
        input_tx: mpsc::Sender<InputCommand>,
        settings: SettingsHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker,
            injector,
            popup,
            input_tx,
            settings,
        })
    }

    fn send_input(&self, cmd: InputCommand) {
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            if tx.send(cmd).await.is_err() {
                log::warn!("input task gone, command dropped");
            }
        });
    }

    /// Stream one request's updates into machine events.
    fn spawn_generation(&self, req: GenerationRequest, tx: mpsc::Sender<Event>) {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            let id = req.id;
            let client_rx = {
                let guard = worker.lock().await;
                if let Some(client) = guard.as_ref() {
                    Some(client.generate(&req).await)
                } else {
                    None
                }
            };

            let mut rx = match client_rx {
                Some(Ok(rx)) => rx,
                Some(Err(e)) => {
                    let _ = tx
                        .send(Event::Failed {
                            id,
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
                None => {
                    let _ = tx
                        .send(Event::Failed {
                            id,
                            message: "AI worker is not running".into(),
                        })
                        .await;
                    return;
                }
            };

            while let Some(update) = rx.recv().await {
                let event = match update {
                    StreamUpdate::Chunk {
                        text,
                        is_final,
                        explanation,
                    } => Event::Chunk {
                        id,
                        text,
                        is_final,
                        explanation,
                    },
                    StreamUpdate::Complete { text } => Event::Complete { id, text },
                    StreamUpdate::Failed { message } => Event::Failed { id, message },
                };
                let done = matches!(
                    event,
                    Event::Chunk { is_final: true, .. } | Event::Complete { .. } | Event::Failed { .. }
                );
                if tx.send(event).await.is_err() {
                    return;
                }
                if done {
                    return;
                }
            }
        });
    }

    /// Coding-mode explanation: streams into the side window only, never
    /// into the session.
    fn spawn_explanation(&self, clipboard: String, code: String) {
        let worker = self.worker.clone();
        let popup = self.popup.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let req = GenerationRequest::new(
                GenerationMode::Explanation,
                clipboard,
                GenerationContext {
                    code: Some(code),
                    ..Default::default()
                },
            );

            let rx = {
                let guard = worker.lock().await;
                if let Some(client) = guard.as_ref() {
                    Some(client.generate(&req).await)
                } else {
                    None
                }
            };
            let Some(Ok(mut rx)) = rx else { return };

            let mut accumulated = String::new();
            while let Some(update) = rx.recv().await {
                match update {
                    StreamUpdate::Chunk { text, is_final, .. } => {
                        accumulated.push_str(&text);
                        popup.append_explanation(&text);
                        if is_final {
                            break;
                        }
                    }
                    StreamUpdate::Complete { text } => {
                        accumulated.push_str(&text);
                        popup.append_explanation(&text);
                        break;
                    }
                    StreamUpdate::Failed { message } => {
                        log::warn!("explanation stream failed: {}", message);
                        break;
                    }
                }
            }
            popup.end_explanation();
            if !accumulated.is_empty() {
                settings.set_last_explanation(&accumulated);
            }
        });
    }
}

impl EffectRunner for DaemonEffectRunner {
    fn run(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::Dispatch(req) => self.spawn_generation(req, tx),

            Effect::DispatchExplanation { clipboard, code } => {
                self.spawn_explanation(clipboard, code);
            }

            Effect::StartTimeout { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(GENERATION_TIMEOUT).await;
                    // Stale timeouts are dropped by the reducer.
                    let _ = tx.send(Event::Timeout { id }).await;
                });
            }

            Effect::CancelWorkerRequest { id } => {
                let worker = self.worker.clone();
                tokio::spawn(async move {
                    if let Some(client) = worker.lock().await.as_ref() {
                        client.cancel(id).await;
                    }
                });
            }

            Effect::PopupShowStream => {
                let popup = self.popup.clone();
                tokio::spawn(async move {
                    let pointer = crate::observer::focus::query_pointer()
                        .await
                        .map(|(x, y)| crate::popup::Point { x, y });
                    popup.show_streaming(pointer);
                });
            }

            Effect::PopupAppend { text } => self.popup.append_chunk(&text),

            Effect::PopupEndStream => self.popup.end_stream(),

            Effect::PopupShowComplete { text } => {
                let popup = self.popup.clone();
                tokio::spawn(async move {
                    let pointer = crate::observer::focus::query_pointer()
                        .await
                        .map(|(x, y)| crate::popup::Point { x, y });
                    popup.show_complete(&text, pointer);
                });
            }

            Effect::PopupShowError { message } => self.popup.show_error(&message),

            Effect::PopupHide => self.popup.hide(),

            Effect::PopupShowVisionPrompt => self.popup.show_vision_prompt(),

            Effect::Inject {
                id,
                text,
                backspaces,
                humanize,
            } => {
                let injector = self.injector.clone();
                tokio::spawn(async move {
                    let req = InjectionRequest {
                        text,
                        backspace_count: backspaces,
                        humanize,
                    };
                    let error = injector.inject(&req).await.err().map(|e| e.to_string());
                    if let Some(e) = &error {
                        log::error!("injection failed: {}", e);
                    }
                    let _ = tx.send(Event::InjectFinished { id, error }).await;
                });
            }

            Effect::ResetBuffer => self.send_input(InputCommand::ResetBuffer),

            Effect::UnfreezeTriggers => self.send_input(InputCommand::Unfreeze),

            Effect::SetAiOutput { output, context } => {
                self.send_input(InputCommand::SetAiOutput { output, context });
            }

            Effect::PersistLastOutput { text, explanation } => {
                self.settings.set_last_output(&text, explanation.as_deref());
            }

            Effect::ClearLastOutput => self.settings.clear_last_output(),
        }
    }
}

/// Records effects and simulates success, for tests.
pub struct StubEffectRunner {
    pub effects: std::sync::Mutex<Vec<Effect>>,
}

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            effects: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<Effect> {
        self.effects.lock().unwrap().clone()
    }
}

impl EffectRunner for StubEffectRunner {
    fn run(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        self.effects.lock().unwrap().push(effect.clone());
        if let Effect::Inject { id, .. } = effect {
            tokio::spawn(async move {
                let _ = tx.send(Event::InjectFinished { id, error: None }).await;
            });
        }
    }
}
