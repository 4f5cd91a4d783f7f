//! AI worker wire protocol.
//!
//! The worker is a long-lived child speaking UTF-8 line-delimited JSON on
//! its standard streams, one object per line. Field names here are wire
//! truth — the existing worker binary parses them — so every rename goes
//! through `serde` attributes, never through the Rust identifiers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generation modes, serialized with their wire spelling. The aliases are
/// the legacy names older workers report back; we only ever emit the
/// canonical ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[serde(alias = "backtick")]
    GrammarFix,
    #[serde(alias = "extension")]
    Extend,
    Clipboard,
    ClipboardWithInstruction,
    Explanation,
    FreePrompt,
    Vision,
}

/// Mode-specific context accompanying a generation request. Only the keys
/// that apply to the mode are serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<GenerationMode>,

    /// Prior AI output, for `extend`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,

    /// The user's typed instruction, for `clipboard_with_instruction`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,

    /// Writing tone, for `free_prompt`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,

    /// Selected agent persona.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Generated code, for `explanation`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// One generation request as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub mode: GenerationMode,
    pub prompt: String,
    pub context: GenerationContext,
    pub streaming: bool,
}

impl GenerationRequest {
    pub fn new(mode: GenerationMode, prompt: String, context: GenerationContext) -> Self {
        let mut context = context;
        context.mode = Some(mode);
        Self {
            id: Uuid::new_v4(),
            mode,
            prompt,
            context,
            streaming: true,
        }
    }
}

// ============================================================================
// Outbound (to worker)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum WorkerCommand {
    /// Readiness probe.
    Ping,

    /// Request generation.
    Generate {
        id: Uuid,
        prompt: String,
        context: GenerationContext,
        streaming: bool,
    },

    /// Cancel an in-flight request (best-effort).
    Cancel { id: Uuid },

    /// Graceful exit.
    Shutdown,
}

impl From<&GenerationRequest> for WorkerCommand {
    fn from(req: &GenerationRequest) -> Self {
        WorkerCommand::Generate {
            id: req.id,
            prompt: req.prompt.clone(),
            context: req.context.clone(),
            streaming: req.streaming,
        }
    }
}

// ============================================================================
// Inbound (from worker)
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// First line on the worker's stdout.
    Started {
        success: bool,
        #[serde(default)]
        pid: Option<u32>,
    },

    /// Streaming delta; `final=true` terminates the stream.
    Chunk {
        #[serde(default)]
        id: Option<Uuid>,
        #[serde(default)]
        text: String,
        #[serde(rename = "final", default)]
        is_final: bool,
        #[serde(default)]
        explanation: Option<String>,
    },

    /// Non-streaming one-shot result.
    Complete {
        #[serde(default)]
        id: Option<Uuid>,
        #[serde(default)]
        text: String,
    },

    /// Fatal for the named request (or the worker when no id).
    Error {
        #[serde(default)]
        id: Option<Uuid>,
        #[serde(default)]
        message: String,
    },

    /// Probe response.
    Pong,

    /// Anything this version does not handle (shutdown_ack, stopped, ...).
    /// Unknown events are logged, never fatal.
    #[serde(other)]
    Unknown,
}
