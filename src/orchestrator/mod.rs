//! Orchestrator: one ordered mailbox, one session at a time.
//!
//! Trigger, chunk, hotkey, and supervisor messages all arrive through a
//! single channel so the state machine never races. The reducer in
//! `machine` decides; the runner in `runner` acts.

pub mod machine;
pub mod runner;

pub use machine::{Effect, Event, Phase, ReduceCtx, Session};
pub use runner::{
    DaemonEffectRunner, EffectRunner, InputCommand, StubEffectRunner, GENERATION_TIMEOUT,
};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::SettingsHandle;
use crate::triggers::TriggerEvent;

/// Everything the orchestrator's mailbox accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorMsg {
    Machine(Event),
    /// Pause/Resume hotkey.
    PauseToggle,
    /// Supervisor verdict on the AI worker.
    WorkerAvailability(bool),
    Shutdown,
}

pub struct Orchestrator {
    phase: Phase,
    paused: bool,
    queued_trigger: Option<TriggerEvent>,
    worker_available: bool,
    runner: Arc<dyn EffectRunner>,
    settings: SettingsHandle,
    event_tx: mpsc::Sender<Event>,
}

impl Orchestrator {
    /// Build the orchestrator and its mailbox. Runner completions are
    /// forwarded into the same mailbox to keep ordering total.
    pub fn new(
        runner: Arc<dyn EffectRunner>,
        settings: SettingsHandle,
        mailbox_capacity: usize,
    ) -> (Self, mpsc::Sender<OrchestratorMsg>, mpsc::Receiver<OrchestratorMsg>) {
        let (msg_tx, msg_rx) = mpsc::channel(mailbox_capacity);
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(mailbox_capacity);

        let forward_tx = msg_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward_tx.send(OrchestratorMsg::Machine(event)).await.is_err() {
                    break;
                }
            }
        });

        (
            Self {
                phase: Phase::Idle,
                paused: false,
                queued_trigger: None,
                worker_available: false,
                runner,
                settings,
                event_tx,
            },
            msg_tx,
            msg_rx,
        )
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Drive the mailbox until shutdown.
    pub async fn run(mut self, mut rx: mpsc::Receiver<OrchestratorMsg>) {
        while let Some(msg) = rx.recv().await {
            if !self.handle(msg) {
                break;
            }
        }
        log::info!("orchestrator stopped");
    }

    /// Process one message. Returns false on shutdown. Split from `run`
    /// so tests can drive the mailbox synchronously.
    pub fn handle(&mut self, msg: OrchestratorMsg) -> bool {
        match msg {
            OrchestratorMsg::Shutdown => return false,

            OrchestratorMsg::WorkerAvailability(available) => {
                if self.worker_available != available {
                    log::info!("AI worker availability: {}", available);
                }
                self.worker_available = available;
            }

            OrchestratorMsg::PauseToggle => {
                self.paused = !self.paused;
                log::info!("trigger dispatch {}", if self.paused { "paused" } else { "resumed" });
                if !self.paused {
                    if let Some(trigger) = self.queued_trigger.take() {
                        self.step(Event::Trigger(trigger));
                    }
                }
            }

            OrchestratorMsg::Machine(event) => {
                // Paused: triggers are recognized but held in a one-deep
                // queue, replaced by later ones.
                if self.paused {
                    if let Event::Trigger(trigger) = event {
                        if self.queued_trigger.replace(trigger).is_some() {
                            log::debug!("queued trigger replaced while paused");
                        }
                        // Recognition must keep running so a later trigger
                        // can replace this one.
                        self.runner
                            .run(Effect::UnfreezeTriggers, self.event_tx.clone());
                        return true;
                    }
                }
                self.step(event);
            }
        }
        true
    }

    fn step(&mut self, event: Event) {
        let settings = self.settings.snapshot();
        let ctx = ReduceCtx {
            auto_inject: settings.auto_inject,
            humanize: settings.humanize_typing || settings.ultra_human,
            coding_mode: settings.coding_mode,
            worker_available: self.worker_available,
            tone: settings.tone().to_string(),
            last_generated_text: settings.last_generated_text.clone(),
        };

        let (next, effects) = machine::reduce(&self.phase, event, &ctx);
        if std::mem::discriminant(&next) != std::mem::discriminant(&self.phase) {
            log::debug!("session phase: {:?}", phase_name(&next));
        }
        self.phase = next;

        for effect in effects {
            self.runner.run(effect, self.event_tx.clone());
        }
    }
}

fn phase_name(phase: &Phase) -> &'static str {
    match phase {
        Phase::Idle => "Idle",
        Phase::Dispatching { .. } => "Dispatching",
        Phase::Streaming { .. } => "Streaming",
        Phase::Presenting { .. } => "Presenting",
        Phase::Injecting { .. } => "Injecting",
    }
}
