//! System-wide key observation.
//!
//! Reads keyboard events directly from /dev/input/event* devices, bypassing
//! compositor-level input isolation, and emits a normalized stream of
//! `RawKeyEvent`s plus active-window changes onto one bounded channel.
//!
//! # Requirements
//! - User must be in the `input` group: `sudo usermod -aG input $USER`
//! - Log out and back in after adding to group

pub mod detector;
pub mod focus;
pub mod keymap;
mod monitor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::inject::EchoGuard;
use detector::{Chord, HotkeyAction, HotkeyHit};
use keymap::LogicalKey;

pub use monitor::{check_permissions, find_keyboards};

/// Bound on the observer's event queue. Consumer starvation drops events
/// (counted, logged) instead of blocking the device readers.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// A normalized key event.
#[derive(Debug, Clone, Copy)]
pub struct RawKeyEvent {
    pub key: evdev::Key,
    pub logical: LogicalKey,
    pub is_key_down: bool,
    pub is_modifier: bool,
    /// Set when the event arrived inside an open echo-suppression window,
    /// i.e. it is (or may be) our own injector typing.
    pub is_system_injected: bool,
    pub timestamp: Instant,
}

/// The foreground window at some instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveContext {
    pub window_title: String,
    pub process_name: String,
    pub is_sensitive: bool,
}

impl ActiveContext {
    pub fn classify(window_title: String, process_name: String) -> Self {
        let is_sensitive = crate::privacy::is_sensitive(&window_title, &process_name);
        Self {
            window_title,
            process_name,
            is_sensitive,
        }
    }
}

/// Everything the observer emits, in arrival order.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Key(RawKeyEvent),
    Hotkey(HotkeyHit),
    FocusChange(ActiveContext),
}

/// Handle to the running observer.
pub struct Observer {
    cancel: CancellationToken,
    focus_poke: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    device_count: usize,
}

impl Observer {
    /// Install the hook: enumerate keyboards, spawn one monitor task per
    /// device plus the focus tracker, and hand back the event stream.
    ///
    /// Fails fatally when no readable keyboard device exists.
    pub fn start(
        bindings: std::collections::HashMap<Chord, HotkeyAction>,
        echo: Arc<EchoGuard>,
    ) -> Result<(Self, mpsc::Receiver<ObserverEvent>), crate::error::DaemonError> {
        let keyboards = find_keyboards();
        check_permissions(&keyboards)
            .map_err(crate::error::DaemonError::HookInstallFailed)?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));
        let focus_poke = Arc::new(Notify::new());
        let device_count = keyboards.len();

        log::info!("observer starting on {} keyboard device(s)", device_count);

        monitor::spawn_monitors(
            keyboards,
            bindings,
            tx.clone(),
            cancel.clone(),
            dropped.clone(),
            echo,
        );

        focus::spawn_focus_tracker(tx, cancel.clone(), focus_poke.clone());

        Ok((
            Self {
                cancel,
                focus_poke,
                dropped,
                device_count,
            },
            rx,
        ))
    }

    /// Ask the focus tracker for an immediate re-check (the input task
    /// calls this every 100 key events).
    pub fn poke_focus(&self) {
        self.focus_poke.notify_one();
    }

    /// Events dropped due to a full queue since start.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Uninstall the hook. The event channel drains and closes once the
    /// device tasks observe the cancellation.
    pub fn stop(&self) {
        log::info!("observer stopping");
        self.cancel.cancel();
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
