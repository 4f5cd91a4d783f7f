//! Daemon-level error taxonomy.
//!
//! Component modules keep their own narrow error enums; everything that can
//! end or degrade the daemon funnels into `DaemonError` so `main` can map it
//! to an exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// The keyboard hook could not be installed. Fatal at startup.
    #[error("keyboard hook install failed: {0}")]
    HookInstallFailed(String),

    /// The configuration on disk could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The supervisor exhausted its restart budget for a required child.
    #[error("supervisor gave up on required child '{child}': {reason}")]
    SupervisorGaveUp { child: String, reason: String },

    /// The AI worker is not running or not ready.
    #[error("AI worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The AI worker violated the line protocol.
    #[error("AI worker protocol violation: {0}")]
    WorkerProtocol(String),

    #[error("generation timed out with no output")]
    GenerationTimeout,

    #[error("clipboard unavailable: {0}")]
    ClipboardUnavailable(String),

    /// A provider key required by the requested mode is not configured.
    #[error("missing configuration key: {0}")]
    ConfigMissingKey(String),

    #[error("canceled")]
    Canceled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Process exit code for errors that end the daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::HookInstallFailed(_) => 1,
            DaemonError::ConfigInvalid(_) => 2,
            DaemonError::SupervisorGaveUp { .. } => 3,
            _ => 1,
        }
    }

    /// Whether the error should be surfaced to the user in the popup, as
    /// opposed to only logged. Cancellation is never user-visible.
    pub fn user_visible(&self) -> bool {
        !matches!(self, DaemonError::Canceled)
    }
}
