//! Hotkey detection with modifier state tracking.
//!
//! Each device monitor owns one detector. Chords are matched on key press
//! (never repeat); hold-style actions (voice) also report the release of
//! the chord's main key.

use std::collections::HashMap;
use std::fmt;

use evdev::Key;

use super::keymap;

/// Global command hotkeys. These are not derived from the buffer; they are
/// converted to trigger/control events directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeyAction {
    /// Show/hide the overlay window.
    ToggleOverlay,
    /// Inject the most recent generation result.
    PasteLast,
    /// Generate from the current buffer (also the extension re-trigger arm).
    Generate,
    /// Generate from clipboard contents (buffer becomes the instruction).
    Clipboard,
    /// Screenshot + vision prompt.
    Screenshot,
    /// Hold-to-talk voice capture.
    Voice,
    /// Open the settings surface.
    Settings,
    /// Cancel the in-flight session / hide popups.
    Cancel,
    /// Pause or resume trigger dispatch.
    PauseResume,
}

impl HotkeyAction {
    pub const ALL: &'static [HotkeyAction] = &[
        HotkeyAction::ToggleOverlay,
        HotkeyAction::PasteLast,
        HotkeyAction::Generate,
        HotkeyAction::Clipboard,
        HotkeyAction::Screenshot,
        HotkeyAction::Voice,
        HotkeyAction::Settings,
        HotkeyAction::Cancel,
        HotkeyAction::PauseResume,
    ];
}

/// A modifier+key chord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chord {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub key: Key,
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.ctrl {
            parts.push("ctrl".to_string());
        }
        if self.alt {
            parts.push("alt".to_string());
        }
        if self.shift {
            parts.push("shift".to_string());
        }
        if self.meta {
            parts.push("meta".to_string());
        }
        parts.push(key_name(self.key).unwrap_or_else(|| format!("{:?}", self.key)));
        write!(f, "{}", parts.join("+"))
    }
}

/// Parse "ctrl+alt+g" style chord descriptions from settings.
pub fn parse_chord(spec: &str) -> Result<Chord, String> {
    let mut chord = Chord {
        ctrl: false,
        alt: false,
        shift: false,
        meta: false,
        key: Key::KEY_RESERVED,
    };
    let mut main_key = None;

    for part in spec.split('+') {
        let part = part.trim().to_lowercase();
        match part.as_str() {
            "ctrl" | "control" => chord.ctrl = true,
            "alt" => chord.alt = true,
            "shift" => chord.shift = true,
            "meta" | "super" | "cmd" | "win" => chord.meta = true,
            other => {
                if main_key.is_some() {
                    return Err(format!("hotkey '{}' has more than one main key", spec));
                }
                main_key = Some(named_key(other).ok_or_else(|| {
                    format!("hotkey '{}': unknown key name '{}'", spec, other)
                })?);
            }
        }
    }

    chord.key = main_key.ok_or_else(|| format!("hotkey '{}' has no main key", spec))?;
    Ok(chord)
}

fn named_key(name: &str) -> Option<Key> {
    let key = match name {
        "a" => Key::KEY_A,
        "b" => Key::KEY_B,
        "c" => Key::KEY_C,
        "d" => Key::KEY_D,
        "e" => Key::KEY_E,
        "f" => Key::KEY_F,
        "g" => Key::KEY_G,
        "h" => Key::KEY_H,
        "i" => Key::KEY_I,
        "j" => Key::KEY_J,
        "k" => Key::KEY_K,
        "l" => Key::KEY_L,
        "m" => Key::KEY_M,
        "n" => Key::KEY_N,
        "o" => Key::KEY_O,
        "p" => Key::KEY_P,
        "q" => Key::KEY_Q,
        "r" => Key::KEY_R,
        "s" => Key::KEY_S,
        "t" => Key::KEY_T,
        "u" => Key::KEY_U,
        "v" => Key::KEY_V,
        "w" => Key::KEY_W,
        "x" => Key::KEY_X,
        "y" => Key::KEY_Y,
        "z" => Key::KEY_Z,
        "0" => Key::KEY_0,
        "1" => Key::KEY_1,
        "2" => Key::KEY_2,
        "3" => Key::KEY_3,
        "4" => Key::KEY_4,
        "5" => Key::KEY_5,
        "6" => Key::KEY_6,
        "7" => Key::KEY_7,
        "8" => Key::KEY_8,
        "9" => Key::KEY_9,
        "space" => Key::KEY_SPACE,
        "enter" | "return" => Key::KEY_ENTER,
        "tab" => Key::KEY_TAB,
        "escape" | "esc" => Key::KEY_ESC,
        "backspace" => Key::KEY_BACKSPACE,
        "grave" | "backtick" => Key::KEY_GRAVE,
        "f1" => Key::KEY_F1,
        "f2" => Key::KEY_F2,
        "f3" => Key::KEY_F3,
        "f4" => Key::KEY_F4,
        "f5" => Key::KEY_F5,
        "f6" => Key::KEY_F6,
        "f7" => Key::KEY_F7,
        "f8" => Key::KEY_F8,
        "f9" => Key::KEY_F9,
        "f10" => Key::KEY_F10,
        "f11" => Key::KEY_F11,
        "f12" => Key::KEY_F12,
        _ => return None,
    };
    Some(key)
}

fn key_name(key: Key) -> Option<String> {
    let name = match key {
        Key::KEY_SPACE => "space",
        Key::KEY_ENTER => "enter",
        Key::KEY_TAB => "tab",
        Key::KEY_ESC => "escape",
        Key::KEY_GRAVE => "grave",
        _ => {
            let dbg = format!("{:?}", key);
            return dbg.strip_prefix("KEY_").map(|s| s.to_lowercase());
        }
    };
    Some(name.to_string())
}

/// Tracks left/right modifier pairs.
#[derive(Debug, Default)]
pub struct ModifierState {
    left_ctrl: bool,
    right_ctrl: bool,
    left_alt: bool,
    right_alt: bool,
    left_shift: bool,
    right_shift: bool,
    left_meta: bool,
    right_meta: bool,
}

impl ModifierState {
    pub fn update(&mut self, key: Key, pressed: bool) {
        match key {
            Key::KEY_LEFTCTRL => self.left_ctrl = pressed,
            Key::KEY_RIGHTCTRL => self.right_ctrl = pressed,
            Key::KEY_LEFTALT => self.left_alt = pressed,
            Key::KEY_RIGHTALT => self.right_alt = pressed,
            Key::KEY_LEFTSHIFT => self.left_shift = pressed,
            Key::KEY_RIGHTSHIFT => self.right_shift = pressed,
            Key::KEY_LEFTMETA => self.left_meta = pressed,
            Key::KEY_RIGHTMETA => self.right_meta = pressed,
            _ => {}
        }
    }

    pub fn ctrl(&self) -> bool {
        self.left_ctrl || self.right_ctrl
    }

    pub fn alt(&self) -> bool {
        self.left_alt || self.right_alt
    }

    pub fn shift(&self) -> bool {
        self.left_shift || self.right_shift
    }

    pub fn meta(&self) -> bool {
        self.left_meta || self.right_meta
    }
}

/// A hotkey match reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeyHit {
    pub action: HotkeyAction,
    /// false for the release of a held chord's main key (hold-to-talk).
    pub pressed: bool,
}

pub struct HotkeyDetector {
    modifiers: ModifierState,
    bindings: HashMap<Chord, HotkeyAction>,
    /// Main key of the chord currently held down, if any.
    held: Option<(Key, HotkeyAction)>,
}

impl HotkeyDetector {
    pub fn new(bindings: HashMap<Chord, HotkeyAction>) -> Self {
        Self {
            modifiers: ModifierState::default(),
            bindings,
            held: None,
        }
    }

    pub fn shift(&self) -> bool {
        self.modifiers.shift()
    }

    /// Whether any command modifier (ctrl/alt/meta) is currently down.
    /// Printable decoding is skipped while a chord is being formed.
    pub fn command_modifier_down(&self) -> bool {
        self.modifiers.ctrl() || self.modifiers.alt() || self.modifiers.meta()
    }

    /// Process a key event. `value`: 0 = released, 1 = pressed, 2 = repeat.
    pub fn process_key(&mut self, key: Key, value: i32) -> Option<HotkeyHit> {
        let pressed = value == 1;
        self.modifiers.update(key, pressed);

        // Release of a held chord's main key ends the hold.
        if value == 0 {
            if let Some((held_key, action)) = self.held {
                if held_key == key {
                    self.held = None;
                    return Some(HotkeyHit {
                        action,
                        pressed: false,
                    });
                }
            }
            return None;
        }

        // Match on press only, never on repeat, never on a bare modifier.
        if value != 1 || keymap::is_modifier(key) {
            return None;
        }

        let current = Chord {
            ctrl: self.modifiers.ctrl(),
            alt: self.modifiers.alt(),
            shift: self.modifiers.shift(),
            meta: self.modifiers.meta(),
            key,
        };

        let action = *self.bindings.get(&current)?;
        self.held = Some((key, action));
        Some(HotkeyHit {
            action,
            pressed: true,
        })
    }
}
