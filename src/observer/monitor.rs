//! Keyboard device discovery and per-device event pumps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use evdev::{Device, InputEventKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::inject::EchoGuard;

use super::detector::{Chord, HotkeyAction, HotkeyDetector};
use super::keymap::{self, LogicalKey};
use super::{ObserverEvent, RawKeyEvent};

/// Debounce between hotkey firings, shared across devices.
const HOTKEY_DEBOUNCE_MS: u64 = 300;

/// Shared debounce so the same chord pressed on two devices (or seen twice
/// through device quirks) fires once.
struct DebounceState {
    last_trigger_ms: AtomicU64,
    start: Instant,
}

impl DebounceState {
    fn new() -> Self {
        Self {
            last_trigger_ms: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    fn should_trigger(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_trigger_ms.load(Ordering::SeqCst);

        if now_ms.saturating_sub(last) >= HOTKEY_DEBOUNCE_MS {
            self.last_trigger_ms
                .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        } else {
            false
        }
    }
}

/// Find all keyboard devices on the system.
pub fn find_keyboards() -> Vec<(PathBuf, Device)> {
    evdev::enumerate()
        .filter_map(|(path, device)| {
            let is_keyboard = device.supported_keys().map_or(false, |keys| {
                keys.contains(evdev::Key::KEY_ENTER)
                    && keys.contains(evdev::Key::KEY_SPACE)
                    && keys.contains(evdev::Key::KEY_A)
                    && keys.contains(evdev::Key::KEY_Z)
            });

            if is_keyboard {
                let name = device.name().unwrap_or("Unknown");
                log::info!("found keyboard device: {:?} ({})", path, name);
                Some((path, device))
            } else {
                None
            }
        })
        .collect()
}

/// Check that at least one keyboard is readable, with remediation text.
pub fn check_permissions(keyboards: &[(PathBuf, Device)]) -> Result<(), String> {
    if keyboards.is_empty() {
        let all_devices: Vec<_> = evdev::enumerate().collect();
        if all_devices.is_empty() {
            return Err(
                "No input devices found. Ensure you are in the 'input' group:\n\
                 sudo usermod -aG input $USER\n\
                 Then log out and back in."
                    .to_string(),
            );
        }
        return Err(format!(
            "Found {} input devices but none appear to be keyboards. \
             This might be a permissions issue or no keyboard is connected.",
            all_devices.len()
        ));
    }
    Ok(())
}

pub(super) fn spawn_monitors(
    keyboards: Vec<(PathBuf, Device)>,
    bindings: HashMap<Chord, HotkeyAction>,
    tx: mpsc::Sender<ObserverEvent>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    echo: Arc<EchoGuard>,
) {
    let debounce = Arc::new(DebounceState::new());

    for (path, device) in keyboards {
        let tx = tx.clone();
        let bindings = bindings.clone();
        let cancel = cancel.clone();
        let dropped = dropped.clone();
        let debounce = debounce.clone();
        let echo = echo.clone();
        let path_str = path.to_string_lossy().to_string();

        tokio::spawn(async move {
            monitor_device(path_str, device, bindings, tx, cancel, dropped, debounce, echo)
                .await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_device(
    path: String,
    device: Device,
    bindings: HashMap<Chord, HotkeyAction>,
    tx: mpsc::Sender<ObserverEvent>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    debounce: Arc<DebounceState>,
    echo: Arc<EchoGuard>,
) {
    let name = device.name().unwrap_or("Unknown").to_string();
    log::info!("monitoring keyboard device: {} ({})", path, name);

    let mut detector = HotkeyDetector::new(bindings);

    let mut stream = match device.into_event_stream() {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to create event stream for {}: {}", path, e);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("key monitoring cancelled for {}", path);
                break;
            }

            result = stream.next_event() => {
                match result {
                    Ok(ev) => {
                        let InputEventKind::Key(key) = ev.kind() else {
                            continue;
                        };
                        let value = ev.value();
                        let hit = detector.process_key(key, value);

                        // Skip repeats entirely; the target app sees them
                        // but they are not distinct keystrokes for us.
                        if value == 2 {
                            continue;
                        }

                        let is_modifier = keymap::is_modifier(key);
                        // While a command chord is forming, the main key is
                        // not text input.
                        let logical = if detector.command_modifier_down() && !is_modifier {
                            LogicalKey::Other
                        } else {
                            keymap::decode(key, detector.shift())
                        };

                        let event = RawKeyEvent {
                            key,
                            logical,
                            is_key_down: value == 1,
                            is_modifier,
                            is_system_injected: echo.is_suppressed(),
                            timestamp: Instant::now(),
                        };

                        push(&tx, &dropped, ObserverEvent::Key(event));

                        if let Some(hit) = hit {
                            if !hit.pressed || debounce.should_trigger() {
                                log::debug!("hotkey {:?} (pressed={})", hit.action, hit.pressed);
                                push(&tx, &dropped, ObserverEvent::Hotkey(hit));
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("device read error for {} (disconnected?): {}", path, e);
                        break;
                    }
                }
            }
        }
    }

    log::info!("stopped monitoring device: {}", path);
}

fn push(tx: &mpsc::Sender<ObserverEvent>, dropped: &AtomicU64, event: ObserverEvent) {
    if tx.try_send(event).is_err() {
        let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 100 == 1 {
            log::warn!("observer queue full, {} events dropped so far", n);
        }
    }
}
