//! Daemon wiring: channels, tasks, lifecycle.
//!
//! Scheduling model (one unit per concern):
//! - observer device tasks push one bounded channel;
//! - the input task drains it serially so buffer and triggers stay in
//!   lockstep;
//! - the orchestrator owns the session state machine behind one ordered
//!   mailbox;
//! - the supervisor keeps the AI worker alive;
//! - injection is serialized inside the injector client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::config::keystore::{self, KeyStore};
use crate::config::{envfile, ConfigSnapshot, Settings, SettingsHandle};
use crate::capture::CaptureRegistry;
use crate::error::DaemonError;
use crate::inject::{EchoGuard, InjectorClient};
use crate::keylog::TypingLog;
use crate::observer::detector::HotkeyAction;
use crate::observer::{Observer, ObserverEvent};
use crate::orchestrator::{
    DaemonEffectRunner, Event, InputCommand, Orchestrator, OrchestratorMsg,
};
use crate::pipeline::{InputPipeline, PipelineAction};
use crate::popup::{NullSink, PopupController, PopupSink};
use crate::supervisor::{ChildEvent, RestartPolicy, RunOutcome, Supervisor};
use crate::worker::WorkerClient;

/// Keystroke log flush cadence.
const INPUT_TICK: Duration = Duration::from_millis(500);

const WORKER_CHILD: &str = "ai-worker";

/// Handle for embedding surfaces (overlay UI, tray): free prompts, vision
/// instructions, settings switches.
#[derive(Clone)]
pub struct DaemonHandle {
    orch_tx: mpsc::Sender<OrchestratorMsg>,
    input_tx: mpsc::Sender<InputCommand>,
    settings: SettingsHandle,
    worker: Arc<Mutex<Option<WorkerClient>>>,
}

impl DaemonHandle {
    pub async fn submit_free_prompt(&self, prompt: String) {
        let _ = self
            .orch_tx
            .send(OrchestratorMsg::Machine(Event::FreePrompt { prompt }))
            .await;
    }

    pub async fn submit_vision_instruction(&self, instruction: String) {
        let _ = self
            .orch_tx
            .send(OrchestratorMsg::Machine(Event::VisionPrompt { instruction }))
            .await;
    }

    pub async fn set_live_mode(&self, enabled: bool) {
        self.settings.update(|s| s.live_mode = enabled);
        let _ = self.input_tx.send(InputCommand::SetLiveMode(enabled)).await;
    }

    /// Master switch. Disabling asks the worker to exit cleanly, which
    /// ends its supervision without backoff.
    pub async fn set_master_enabled(&self, enabled: bool) {
        self.settings.update(|s| s.master_enabled = enabled);
        let _ = self.input_tx.send(InputCommand::SetEnabled(enabled)).await;
        if !enabled {
            if let Some(client) = self.worker.lock().await.as_ref() {
                client.shutdown().await;
            }
        }
    }

    pub async fn clear_keylog(&self) {
        let _ = self.input_tx.send(InputCommand::ClearKeylog).await;
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }
}

/// Run the daemon until SIGINT/SIGTERM or a fatal supervision failure.
/// `on_ready` receives the control handle once everything is wired, for
/// an embedding surface (overlay UI, tray) to keep.
pub async fn run(
    sink: Arc<dyn PopupSink>,
    on_ready: impl FnOnce(DaemonHandle),
) -> Result<(), DaemonError> {
    let settings = Settings::load()?;
    let settings_handle = SettingsHandle::new(settings.clone(), Settings::settings_path());

    // Hotkey table is validated up front: a broken config is exit 2, not a
    // daemon that silently ignores chords.
    let bindings = settings.bindings()?;

    // Capture exemption for every owned surface; failures degrade to
    // capture-visible and are recorded in the snapshot.
    let mut capture = CaptureRegistry::new();
    for surface in ["popup", "overlay", "explanation"] {
        capture.register(surface);
    }
    let capture_statuses = capture.statuses().to_vec();

    // Provider keys resolved once at startup for the missing-key warning;
    // each worker (re)start re-resolves.
    {
        let env_map = envfile::load(&settings.env_file_path());
        let keystore = KeyStore::load(Settings::config_dir().join(keystore::KEYSTORE_FILE_NAME));
        let snapshot = ConfigSnapshot::assemble(&settings, &env_map, &keystore, &capture_statuses);
        if !snapshot.has_any_provider_key() {
            log::warn!(
                "no provider API key configured; AI triggers stay unavailable until one is set"
            );
        }
    }

    let echo = Arc::new(EchoGuard::new());

    let (observer, observer_rx) = Observer::start(bindings, echo.clone())?;
    let observer = Arc::new(observer);

    let popup = PopupController::new(sink, settings.work_area_rect(), settings.popup_size());

    let worker_slot: Arc<Mutex<Option<WorkerClient>>> = Arc::new(Mutex::new(None));
    let injector = Arc::new(InjectorClient::new(
        settings.injector_binary_path(),
        echo.clone(),
        settings.tab_as_spaces,
    ));

    let (input_tx, input_rx) = mpsc::channel::<InputCommand>(64);

    let runner = DaemonEffectRunner::new(
        worker_slot.clone(),
        injector,
        popup.clone(),
        input_tx.clone(),
        settings_handle.clone(),
    );

    let (orchestrator, orch_tx, orch_rx) = Orchestrator::new(runner, settings_handle.clone(), 256);
    tokio::spawn(orchestrator.run(orch_rx));

    // Supervision. The worker child resolves a fresh ConfigSnapshot at
    // every (re)start, so settings edits land on the next restart, never
    // mid-session.
    let (child_events_tx, mut child_events_rx) = mpsc::channel::<ChildEvent>(32);
    let supervisor = Supervisor::new(child_events_tx);
    if settings.master_enabled {
        supervisor.supervise(
            WORKER_CHILD,
            worker_child_factory(
                settings_handle.clone(),
                worker_slot.clone(),
                orch_tx.clone(),
                capture_statuses.clone(),
            ),
            RestartPolicy::default(),
        );
    } else {
        log::info!("master switch is off; AI worker not started");
    }

    // Child lifecycle -> availability + fatal give-up.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<DaemonError>(1);
    {
        let orch_tx = orch_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = child_events_rx.recv().await {
                match event {
                    ChildEvent::Started { name } => {
                        log::info!("child '{}' is up", name);
                    }
                    ChildEvent::Down { name, .. } => {
                        if name == WORKER_CHILD {
                            let _ = orch_tx.send(OrchestratorMsg::WorkerAvailability(false)).await;
                        }
                    }
                    ChildEvent::GaveUp { name, reason } => {
                        let _ = orch_tx.send(OrchestratorMsg::WorkerAvailability(false)).await;
                        if name == WORKER_CHILD {
                            let _ = fatal_tx
                                .send(DaemonError::SupervisorGaveUp { child: name, reason })
                                .await;
                        }
                    }
                }
            }
        });
    }

    // Input task: the single consumer of observer events.
    {
        let keylog = settings
            .keylog_enabled
            .then(|| TypingLog::new(Settings::data_dir().join("keylog.json")));
        let pipeline = InputPipeline::new(settings.live_mode, settings.master_enabled, keylog);
        let observer = observer.clone();
        let orch_tx = orch_tx.clone();
        let popup = popup.clone();
        tokio::spawn(input_task(
            pipeline, observer_rx, input_rx, orch_tx, observer, popup,
        ));
    }

    on_ready(DaemonHandle {
        orch_tx: orch_tx.clone(),
        input_tx: input_tx.clone(),
        settings: settings_handle,
        worker: worker_slot.clone(),
    });

    log::info!("keyflow daemon running ({} keyboard devices)", observer.device_count());

    // Wait for a shutdown signal or a fatal supervision failure.
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received, shutting down");
            Ok(())
        }
        Some(fatal) = fatal_rx.recv() => Err(fatal),
    };

    // Orderly teardown: stop the hook, stop children, let the worker exit.
    observer.stop();
    supervisor.stop();
    if let Some(client) = worker_slot.lock().await.as_ref() {
        client.shutdown().await;
    }
    let _ = orch_tx.send(OrchestratorMsg::Shutdown).await;
    capture.unregister_all();

    result
}

/// Build the supervised run-future factory for the AI worker child.
fn worker_child_factory(
    settings: SettingsHandle,
    slot: Arc<Mutex<Option<WorkerClient>>>,
    orch_tx: mpsc::Sender<OrchestratorMsg>,
    capture_statuses: Vec<crate::capture::CaptureStatus>,
) -> crate::supervisor::ChildFactory {
    Box::new(move || {
        let settings = settings.clone();
        let slot = slot.clone();
        let orch_tx = orch_tx.clone();
        let capture_statuses = capture_statuses.clone();
        Box::pin(async move {
            let current = settings.snapshot();
            let env_map = envfile::load(&current.env_file_path());
            let keystore =
                KeyStore::load(Settings::config_dir().join(keystore::KEYSTORE_FILE_NAME));
            let snapshot =
                ConfigSnapshot::assemble(&current, &env_map, &keystore, &capture_statuses);

            let (client, mut child) =
                WorkerClient::spawn(&current.worker_command, &snapshot.worker_env())
                    .await
                    .map_err(|e| e.to_string())?;

            *slot.lock().await = Some(client);
            let _ = orch_tx.send(OrchestratorMsg::WorkerAvailability(true)).await;

            let status = child.wait().await;

            *slot.lock().await = None;
            let _ = orch_tx.send(OrchestratorMsg::WorkerAvailability(false)).await;

            match status {
                Ok(status) if status.success() => Ok(RunOutcome::Clean),
                Ok(status) => Ok(RunOutcome::Failed(format!("worker exited with {}", status))),
                Err(e) => Ok(RunOutcome::Failed(format!("wait failed: {}", e))),
            }
        })
    })
}

/// The input task: drains observer events, drives the pipeline, owns its
/// timers.
async fn input_task(
    mut pipeline: InputPipeline,
    mut observer_rx: mpsc::Receiver<ObserverEvent>,
    mut input_rx: mpsc::Receiver<InputCommand>,
    orch_tx: mpsc::Sender<OrchestratorMsg>,
    observer: Arc<Observer>,
    popup: Arc<PopupController>,
) {
    let mut tick = tokio::time::interval(INPUT_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        // A pending live firing turns into a timer; otherwise sleep far out.
        let live_deadline = pipeline
            .live_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            biased;

            cmd = input_rx.recv() => {
                let Some(cmd) = cmd else { break };
                apply_command(&mut pipeline, cmd);
            }

            event = observer_rx.recv() => {
                let Some(event) = event else {
                    log::info!("observer stream closed, input task exiting");
                    break;
                };
                let actions = pipeline.handle(event, Instant::now());
                for action in actions {
                    dispatch_action(&mut pipeline, action, &orch_tx, &observer, &popup).await;
                }
            }

            _ = tokio::time::sleep_until(live_deadline.into()) => {
                if let Some(trigger) = pipeline.fire_live() {
                    log::info!("live trigger fired ({} chars)", trigger.buffer.text.chars().count());
                    let _ = orch_tx
                        .send(OrchestratorMsg::Machine(Event::Trigger(trigger)))
                        .await;
                }
            }

            _ = tick.tick() => {
                pipeline.tick(Instant::now());
            }
        }
    }
}

fn apply_command(pipeline: &mut InputPipeline, cmd: InputCommand) {
    match cmd {
        InputCommand::ResetBuffer => pipeline.reset_buffer(),
        InputCommand::Unfreeze => pipeline.unfreeze(),
        InputCommand::SetAiOutput { output, context } => {
            pipeline.set_ai_output(Instant::now(), output, context);
        }
        InputCommand::SetLiveMode(enabled) => pipeline.set_live_mode(enabled),
        InputCommand::SetEnabled(enabled) => pipeline.set_enabled(enabled),
        InputCommand::ClearKeylog => pipeline.clear_keylog(),
    }
}

async fn dispatch_action(
    pipeline: &mut InputPipeline,
    action: PipelineAction,
    orch_tx: &mpsc::Sender<OrchestratorMsg>,
    observer: &Observer,
    popup: &PopupController,
) {
    match action {
        PipelineAction::EmitTrigger(trigger) => {
            let _ = orch_tx
                .send(OrchestratorMsg::Machine(Event::Trigger(trigger)))
                .await;
        }

        PipelineAction::EmitCommand { action, pressed } => match action {
            HotkeyAction::PasteLast if pressed => {
                let _ = orch_tx.send(OrchestratorMsg::Machine(Event::PasteHotkey)).await;
            }
            HotkeyAction::Cancel if pressed => {
                let _ = orch_tx
                    .send(OrchestratorMsg::Machine(Event::CancelRequested))
                    .await;
            }
            HotkeyAction::PauseResume if pressed => {
                let _ = orch_tx.send(OrchestratorMsg::PauseToggle).await;
            }
            HotkeyAction::ToggleOverlay | HotkeyAction::Settings if pressed => {
                popup.toggle_overlay();
            }
            HotkeyAction::Voice if pressed => {
                // Speech capture lives in an optional helper child; without
                // one there is nothing to record, and the user needs to see
                // why the hold did nothing.
                log::info!("voice hotkey pressed but no voice helper is configured");
                popup.show_error("Voice input is unavailable");
            }
            _ => {}
        },

        PipelineAction::FetchClipboard => {
            let clipboard = read_clipboard().await;
            match clipboard {
                Some(text) => {
                    if let Some(trigger) = pipeline.build_clipboard_trigger(text) {
                        let _ = orch_tx
                            .send(OrchestratorMsg::Machine(Event::Trigger(trigger)))
                            .await;
                    }
                }
                None => {
                    popup.show_error("Clipboard is unavailable");
                }
            }
        }

        PipelineAction::FetchScreenshot => {
            // Screenshot capture is an external collaborator; the vision
            // prompt flow still runs and the instruction goes out as a
            // vision request.
            if let Some(trigger) = pipeline.build_screenshot_trigger(None) {
                let _ = orch_tx
                    .send(OrchestratorMsg::Machine(Event::Trigger(trigger)))
                    .await;
            }
        }

        PipelineAction::Escape => {
            let _ = orch_tx
                .send(OrchestratorMsg::Machine(Event::CancelRequested))
                .await;
        }

        PipelineAction::PokeFocus => observer.poke_focus(),

        PipelineAction::FocusChanged(_ctx) => {
            let _ = orch_tx
                .send(OrchestratorMsg::Machine(Event::FocusChanged))
                .await;
        }
    }
}

/// Clipboard read off the async runtime (the clipboard context is not
/// Send on every platform).
async fn read_clipboard() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut clipboard = arboard::Clipboard::new().ok()?;
        clipboard.get_text().ok()
    })
    .await
    .ok()
    .flatten()
}

/// Convenience: run with no rendering surface attached.
pub async fn run_headless() -> Result<(), DaemonError> {
    run(Arc::new(NullSink), |_| {}).await
}
