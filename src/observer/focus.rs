//! Active-window tracking.
//!
//! Polls the desktop's window utility once a second (and immediately when
//! poked after a burst of typing) and emits a `FocusChange` whenever the
//! foreground window changes. Platforms without a usable utility yield an
//! empty context, which classifies as non-sensitive and never matches a
//! window-change reset spuriously.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::{ActiveContext, ObserverEvent};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub(super) fn spawn_focus_tracker(
    tx: mpsc::Sender<ObserverEvent>,
    cancel: CancellationToken,
    poke: Arc<Notify>,
) {
    tokio::spawn(async move {
        let mut last: Option<ActiveContext> = None;

        // Initial focus is emitted at start.
        loop {
            let current = query_active_window().await;
            if last.as_ref() != Some(&current) {
                log::debug!(
                    "focus change: '{}' ({}){}",
                    current.window_title,
                    current.process_name,
                    if current.is_sensitive { " [sensitive]" } else { "" }
                );
                last = Some(current.clone());
                if tx.send(ObserverEvent::FocusChange(current)).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = poke.notified() => {}
            }
        }

        log::debug!("focus tracker stopped");
    });
}

/// Query the foreground window title and owning process name.
pub async fn query_active_window() -> ActiveContext {
    let title = run_tool(&["getactivewindow", "getwindowname"]).await;
    let process = match run_tool(&["getactivewindow", "getwindowpid"]).await {
        Some(pid_str) => process_name_for_pid(pid_str.trim()).await,
        None => None,
    };

    ActiveContext::classify(title.unwrap_or_default(), process.unwrap_or_default())
}

async fn run_tool(args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new("xdotool")
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

async fn process_name_for_pid(pid: &str) -> Option<String> {
    let pid: u32 = pid.parse().ok()?;
    let comm = tokio::fs::read_to_string(format!("/proc/{}/comm", pid))
        .await
        .ok()?;
    Some(comm.trim().to_string())
}

/// Query the pointer position, used to anchor the popup. `None` when the
/// desktop utility is unavailable.
pub async fn query_pointer() -> Option<(i32, i32)> {
    let out = run_tool(&["getmouselocation", "--shell"]).await?;
    let mut x = None;
    let mut y = None;
    for line in out.lines() {
        if let Some(v) = line.strip_prefix("X=") {
            x = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("Y=") {
            y = v.trim().parse().ok();
        }
    }
    Some((x?, y?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_active_window_never_panics_without_tooling() {
        // On machines without xdotool this must degrade to an empty,
        // non-sensitive context.
        let ctx = query_active_window().await;
        assert!(!ctx.is_sensitive || !ctx.window_title.is_empty());
    }
}
