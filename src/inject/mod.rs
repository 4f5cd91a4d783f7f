//! Injection: delete the prompt region and type the generated answer.
//!
//! The daemon side spawns the `injector` binary once per injection
//! (escaped text plus `--backspace N` / `--humanize` flags) and keeps an
//! echo-suppression window open for the child's lifetime so the observer
//! never feeds our own keystrokes back into the buffer.

pub mod escape;
pub mod typer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("keystroke backend init failed: {0}")]
    Init(String),
    #[error("keystroke synthesis failed: {0}")]
    Keystroke(String),
    #[error("clipboard unavailable: {0}")]
    Clipboard(String),
    #[error("injector process failed: {0}")]
    Process(String),
}

/// Synthetic-keystroke suppression window.
///
/// Opened before the injector child starts emitting events and closed after
/// it exits; a short grace period covers events still queued in the input
/// stack at close time. Invariant: while a window is open, observed key
/// events never update the buffer or fire triggers.
#[derive(Debug, Default)]
pub struct EchoGuard {
    active: AtomicUsize,
    grace_until: Mutex<Option<Instant>>,
}

/// Events arriving this soon after the window closes are still treated as
/// synthetic (input stacks buffer).
const ECHO_GRACE: Duration = Duration::from_millis(300);

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn close(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "EchoGuard close without open");
        *self.grace_until.lock().unwrap() = Some(Instant::now() + ECHO_GRACE);
    }

    pub fn is_suppressed(&self) -> bool {
        if self.active.load(Ordering::SeqCst) > 0 {
            return true;
        }
        match *self.grace_until.lock().unwrap() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}

/// Strip per-line leading whitespace (the target editor auto-indents) and
/// trim blank edge lines. The orchestrator applies this exactly once per
/// session, before escaping.
pub fn normalize_indent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(|line| line.trim_start()).collect();

    let first = lines.iter().position(|l| !l.is_empty());
    let last = lines.iter().rposition(|l| !l.is_empty());

    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// One delete-and-type operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRequest {
    pub text: String,
    pub backspace_count: usize,
    pub humanize: bool,
}

/// Client for the injector child. Serialized: at most one delete-and-type
/// in flight.
pub struct InjectorClient {
    binary: PathBuf,
    echo: std::sync::Arc<EchoGuard>,
    tab_as_spaces: bool,
    in_flight: AsyncMutex<()>,
}

impl InjectorClient {
    pub fn new(binary: PathBuf, echo: std::sync::Arc<EchoGuard>, tab_as_spaces: bool) -> Self {
        Self {
            binary,
            echo,
            tab_as_spaces,
            in_flight: AsyncMutex::new(()),
        }
    }

    /// Locate the injector binary next to the daemon executable.
    pub fn sibling_binary() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("injector")))
            .unwrap_or_else(|| PathBuf::from("injector"))
    }

    /// Run one injection. Backspaces complete before the first replacement
    /// character; the echo window stays open until the child has exited.
    pub async fn inject(&self, req: &InjectionRequest) -> Result<(), InjectError> {
        let _serialize = self.in_flight.lock().await;

        let escaped = escape::escape(&req.text);
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg(&escaped);
        if req.backspace_count > 0 {
            cmd.arg("--backspace").arg(req.backspace_count.to_string());
        }
        if req.humanize {
            cmd.arg("--humanize");
        }
        if self.tab_as_spaces {
            cmd.arg("--tab-as-spaces");
        }
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());

        log::info!(
            "injecting {} chars (backspace {}, humanize {})",
            req.text.chars().count(),
            req.backspace_count,
            req.humanize
        );

        self.echo.open();
        let result = async {
            let child = cmd
                .spawn()
                .map_err(|e| InjectError::Process(format!("spawn {:?}: {}", self.binary, e)))?;
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| InjectError::Process(e.to_string()))?;
            if output.status.success() {
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(InjectError::Process(if stderr.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    stderr
                }))
            }
        }
        .await;
        self.echo.close();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_guard_suppresses_while_open() {
        let guard = EchoGuard::new();
        assert!(!guard.is_suppressed());
        guard.open();
        assert!(guard.is_suppressed());
        guard.open();
        guard.close();
        // Still one window open.
        assert!(guard.is_suppressed());
        guard.close();
        // Grace period keeps suppression briefly after close.
        assert!(guard.is_suppressed());
    }

    #[test]
    fn normalize_indent_strips_leading_whitespace() {
        let input = "    def add(a, b):\n        return a + b\n";
        assert_eq!(normalize_indent(input), "def add(a, b):\nreturn a + b");
    }

    #[test]
    fn normalize_indent_trims_blank_edge_lines() {
        let input = "\n\n  first\n  second\n\n\n";
        assert_eq!(normalize_indent(input), "first\nsecond");
    }

    #[test]
    fn normalize_indent_keeps_interior_blank_lines() {
        let input = "a\n\nb";
        assert_eq!(normalize_indent(input), "a\n\nb");
    }

    #[test]
    fn normalize_indent_of_blank_text_is_empty() {
        assert_eq!(normalize_indent("   \n \n"), "");
        assert_eq!(normalize_indent(""), "");
    }
}
