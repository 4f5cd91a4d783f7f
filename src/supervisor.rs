//! Child supervision: spawn, watch, restart with bounded backoff.
//!
//! One policy for every managed child (AI worker, optional voice/vision
//! helpers): exponential backoff from 2 s capped at 30 s, at most 5
//! restarts inside a rolling 10-minute window. Past the budget the child
//! is declared failed; for a required child the daemon gives up (exit
//! code 3), otherwise the dependent triggers go unavailable.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_restarts: 5,
            window: Duration::from_secs(600),
        }
    }
}

/// Rolling-window restart accounting. Pure, unit-tested; the supervisor
/// task just asks it what to do after each exit.
#[derive(Debug)]
pub struct BackoffTracker {
    policy: RestartPolicy,
    recent: VecDeque<Instant>,
    next: Duration,
}

impl BackoffTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            next: policy.initial_backoff,
            policy,
            recent: VecDeque::new(),
        }
    }

    /// The child exited abnormally. Returns the backoff before the next
    /// attempt, or None when the restart budget is spent.
    pub fn on_exit(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if self.recent.len() >= self.policy.max_restarts {
            return None;
        }
        self.recent.push_back(now);
        let backoff = self.next;
        self.next = (self.next * 2).min(self.policy.max_backoff);
        Some(backoff)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.recent.front() {
            if now.duration_since(front) > self.policy.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.is_empty() {
            self.next = self.policy.initial_backoff;
        }
    }
}

/// How one run of a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code zero; stop supervising.
    Clean,
    /// Nonzero exit or stream failure; restart per policy.
    Failed(String),
}

/// Supervision lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// The child started and passed its readiness handshake.
    Started { name: String },
    /// The child exited; a restart may be pending.
    Down { name: String, reason: String },
    /// Restart budget exhausted; the child stays down.
    GaveUp { name: String, reason: String },
}

/// One run of the child: resolves when it exits. Errors mean the child
/// never became ready.
pub type ChildFuture = Pin<Box<dyn Future<Output = Result<RunOutcome, String>> + Send>>;
pub type ChildFactory = Box<dyn FnMut() -> ChildFuture + Send>;

pub struct Supervisor {
    cancel: CancellationToken,
    events_tx: mpsc::Sender<ChildEvent>,
}

impl Supervisor {
    pub fn new(events_tx: mpsc::Sender<ChildEvent>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            events_tx,
        }
    }

    /// Stop all supervised children and cancel pending backoff timers.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Supervise one child until it exits cleanly, the budget runs out, or
    /// the supervisor stops. Exactly one instance of the child runs at any
    /// moment: the next attempt starts only after the previous run's
    /// future resolved.
    pub fn supervise(&self, name: &str, mut factory: ChildFactory, policy: RestartPolicy) {
        let name = name.to_string();
        let cancel = self.cancel.clone();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let mut tracker = BackoffTracker::new(policy);

            loop {
                if cancel.is_cancelled() {
                    break;
                }

                log::info!("starting child '{}'", name);
                let run = factory();

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        log::info!("supervision of '{}' cancelled", name);
                        break;
                    }
                    outcome = run => outcome,
                };

                let reason = match outcome {
                    Ok(RunOutcome::Clean) => {
                        log::info!("child '{}' exited cleanly", name);
                        let _ = events
                            .send(ChildEvent::Down {
                                name: name.clone(),
                                reason: "clean exit".into(),
                            })
                            .await;
                        break;
                    }
                    Ok(RunOutcome::Failed(reason)) => reason,
                    Err(reason) => reason,
                };

                log::warn!("child '{}' down: {}", name, reason);
                let _ = events
                    .send(ChildEvent::Down {
                        name: name.clone(),
                        reason: reason.clone(),
                    })
                    .await;

                match tracker.on_exit(Instant::now()) {
                    Some(backoff) => {
                        log::info!("restarting '{}' in {:?}", name, backoff);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    None => {
                        log::error!("giving up on child '{}': {}", name, reason);
                        let _ = events
                            .send(ChildEvent::GaveUp {
                                name: name.clone(),
                                reason,
                            })
                            .await;
                        break;
                    }
                }
            }
        });
    }

    /// Notify listeners that a child is up (called by the child's own
    /// startup path once its readiness handshake passes).
    pub async fn notify_started(&self, name: &str) {
        let _ = self
            .events_tx
            .send(ChildEvent::Started {
                name: name.to_string(),
            })
            .await;
    }
}
