//! AI worker channel: spawn, readiness handshake, demultiplexing.
//!
//! The client owns both halves of the child's stdio. A writer task
//! serializes commands onto stdin; a reader task parses stdout lines and
//! routes streaming updates to the session that registered the request's
//! correlation id. Different ids may interleave; chunks for one id arrive
//! in order and are delivered in order.
//!
//! The client is transport-generic so tests drive it over in-memory pipes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::{GenerationRequest, WorkerCommand, WorkerEvent};

/// How long the child gets to print its `started` line.
const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-request stream buffer. Chunk pacing is bounded by the popup anyway.
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
    #[error("worker not ready: {0}")]
    NotReady(String),
    #[error("worker protocol violation: {0}")]
    Protocol(String),
    #[error("worker channel closed")]
    ChannelClosed,
}

/// Updates delivered to the session owning a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Chunk {
        text: String,
        is_final: bool,
        explanation: Option<String>,
    },
    Complete {
        text: String,
    },
    Failed {
        message: String,
    },
}

type PendingMap = Arc<Mutex<HashMap<Uuid, mpsc::Sender<StreamUpdate>>>>;

pub struct WorkerClient {
    command_tx: mpsc::Sender<WorkerCommand>,
    pending: PendingMap,
    pid: Option<u32>,
}

impl WorkerClient {
    /// Spawn the worker process and complete the readiness handshake.
    /// Returns the client plus the child handle (the supervisor waits on
    /// it for exit/restart policy).
    pub async fn spawn(
        command: &[String],
        env: &[(String, String)],
    ) -> Result<(Self, tokio::process::Child), WorkerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| WorkerError::SpawnFailed("empty worker command".into()))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed(format!("{}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("no stdout handle".into()))?;

        // Keep the child's stderr visible in our log.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[ai-worker stderr] {}", line);
                }
            });
        }

        let client = Self::connect(stdout, stdin).await?;
        Ok((client, child))
    }

    /// Build a client over an arbitrary transport and wait for the
    /// `{"event":"started",...}` readiness line.
    pub async fn connect<R, W>(reader: R, writer: W) -> Result<Self, WorkerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);

        let pid = tokio::time::timeout(READY_TIMEOUT, Self::await_ready(&mut reader))
            .await
            .map_err(|_| WorkerError::NotReady("timed out waiting for started line".into()))??;

        log::info!("AI worker ready (pid {:?})", pid);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>(32);

        tokio::spawn(write_loop(writer, command_rx));
        tokio::spawn(read_loop(reader, pending.clone()));

        Ok(Self {
            command_tx,
            pending,
            pid,
        })
    }

    async fn await_ready<R>(reader: &mut BufReader<R>) -> Result<Option<u32>, WorkerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| WorkerError::NotReady(e.to_string()))?;
            if n == 0 {
                return Err(WorkerError::NotReady("stream closed before started".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerEvent>(trimmed) {
                Ok(WorkerEvent::Started { success: true, pid }) => return Ok(pid),
                Ok(WorkerEvent::Started { success: false, .. }) => {
                    return Err(WorkerError::NotReady(
                        "worker reported unsuccessful start".into(),
                    ));
                }
                Ok(WorkerEvent::Error { message, .. }) => {
                    // Startup noise (e.g. missing key warnings) precedes the
                    // started line; keep reading but surface it.
                    log::warn!("AI worker startup: {}", message);
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(WorkerError::Protocol(format!(
                        "unparseable line before started: {} ({})",
                        trimmed, e
                    )));
                }
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Dispatch a generation request. Updates stream back on the returned
    /// receiver; the stream ends with a final chunk, a complete, or a
    /// failure.
    pub async fn generate(
        &self,
        req: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamUpdate>, WorkerError> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.pending.lock().unwrap().insert(req.id, tx);

        if let Err(e) = self.send(WorkerCommand::from(req)).await {
            self.pending.lock().unwrap().remove(&req.id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Best-effort cancel. The route is dropped immediately; any chunks the
    /// worker still emits for this id are discarded by the demultiplexer.
    pub async fn cancel(&self, id: Uuid) {
        self.pending.lock().unwrap().remove(&id);
        if let Err(e) = self.send(WorkerCommand::Cancel { id }).await {
            log::warn!("cancel for {} not delivered: {}", id, e);
        }
    }

    pub async fn ping(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::Ping).await
    }

    pub async fn shutdown(&self) {
        let _ = self.send(WorkerCommand::Shutdown).await;
    }

    /// Number of requests currently awaiting updates.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    async fn send(&self, cmd: WorkerCommand) -> Result<(), WorkerError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<WorkerCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        let mut line = match serde_json::to_string(&cmd) {
            Ok(json) => json,
            Err(e) => {
                log::error!("failed to serialize worker command: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::warn!("worker stdin write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            log::warn!("worker stdin flush failed: {}", e);
            break;
        }
    }
    log::debug!("worker writer task exiting");
}

async fn read_loop<R>(reader: BufReader<R>, pending: PendingMap)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerEvent>(trimmed) {
                    Ok(event) => route_event(event, &pending).await,
                    Err(e) => {
                        log::warn!("unparseable worker line (dropped): {} ({})", trimmed, e);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("worker stdout read error: {}", e);
                break;
            }
        }
    }

    // Stream closed: every in-flight request fails recoverably.
    let routes: Vec<_> = pending.lock().unwrap().drain().collect();
    for (id, tx) in routes {
        log::warn!("worker stream closed with request {} in flight", id);
        let _ = tx
            .send(StreamUpdate::Failed {
                message: "AI worker stream closed".into(),
            })
            .await;
    }
    log::debug!("worker reader task exiting");
}

async fn route_event(event: WorkerEvent, pending: &PendingMap) {
    match event {
        WorkerEvent::Chunk {
            id,
            text,
            is_final,
            explanation,
        } => {
            let update = StreamUpdate::Chunk {
                text,
                is_final,
                explanation,
            };
            deliver(pending, id, update, is_final).await;
        }
        WorkerEvent::Complete { id, text } => {
            deliver(pending, id, StreamUpdate::Complete { text }, true).await;
        }
        WorkerEvent::Error { id: Some(id), message } => {
            deliver(pending, Some(id), StreamUpdate::Failed { message }, true).await;
        }
        WorkerEvent::Error { id: None, message } => {
            // Worker-level error: fail everything in flight.
            log::error!("AI worker error: {}", message);
            let routes: Vec<_> = pending.lock().unwrap().drain().collect();
            for (_, tx) in routes {
                let _ = tx
                    .send(StreamUpdate::Failed {
                        message: message.clone(),
                    })
                    .await;
            }
        }
        WorkerEvent::Pong => log::debug!("worker pong"),
        WorkerEvent::Started { .. } => {
            log::warn!("unexpected started event after handshake");
        }
        WorkerEvent::Unknown => log::debug!("ignoring unknown worker event"),
    }
}

/// Route one update. A missing id is tolerated when exactly one request is
/// pending (the original worker omits ids on `complete`).
async fn deliver(pending: &PendingMap, id: Option<Uuid>, update: StreamUpdate, terminal: bool) {
    let resolved = {
        let map = pending.lock().unwrap();
        match id {
            Some(id) => map.contains_key(&id).then_some(id),
            None if map.len() == 1 => map.keys().next().copied(),
            None => None,
        }
    };

    let Some(id) = resolved else {
        log::debug!("dropping update with no route (id {:?})", id);
        return;
    };

    let tx = {
        let mut map = pending.lock().unwrap();
        if terminal {
            map.remove(&id)
        } else {
            map.get(&id).cloned()
        }
    };

    if let Some(tx) = tx {
        if tx.send(update).await.is_err() {
            // Session went away (cancel race); drop the route.
            pending.lock().unwrap().remove(&id);
        }
    }
}
