//! Settings, environment, and the per-worker configuration snapshot.

pub mod envfile;
pub mod keystore;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureStatus;
use crate::error::DaemonError;
use crate::observer::detector::{parse_chord, Chord, HotkeyAction};
use crate::popup::{Rect, Size};

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Provider env vars the agent registry knows how to use.
pub const PROVIDER_ENV_VARS: &[&str] = &[
    "MISTRAL_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GROQ_API_KEY",
];

/// Writing tones accepted by the prompt builder.
pub const TONES: &[&str] = &[
    "professional",
    "casual",
    "friendly",
    "formal",
    "creative",
    "technical",
    "persuasive",
    "concise",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Master switch; off means no trigger reaches the orchestrator and
    /// supervised children stop.
    pub master_enabled: bool,

    /// Inject results directly instead of presenting the popup first.
    pub auto_inject: bool,

    /// Human-paced injection timing.
    pub humanize_typing: bool,

    /// Extra typo-then-correct runs on top of humanized timing.
    pub ultra_human: bool,

    /// Fire a grammar fix on idle pauses.
    pub live_mode: bool,

    /// Show the explanation window for clipboard-family generations.
    pub coding_mode: bool,

    /// Emit tab as four spaces when injecting.
    pub tab_as_spaces: bool,

    /// Writing tone for free-prompt generations.
    pub tone: String,

    /// Selected agent persona.
    pub selected_agent: String,

    /// Most recent completed generation, consumable by Paste-last.
    pub last_generated_text: String,
    pub last_generated_explanation: String,

    /// Keystroke debug log (off by default).
    pub keylog_enabled: bool,

    /// Command line that starts the AI worker child.
    pub worker_command: Vec<String>,

    /// Path to the injector binary; empty means the sibling of the daemon
    /// executable.
    pub injector_binary: String,

    /// Env file consulted for provider keys, relative to the config dir
    /// when not absolute.
    pub env_file: String,

    /// Hotkey bindings, action name -> chord description.
    pub hotkeys: HashMap<String, String>,

    /// Fallback work area when the desktop cannot be queried.
    pub work_area: WorkAreaConfig,

    /// Nominal popup size used for anchoring.
    pub popup: PopupSizeConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkAreaConfig {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Default for WorkAreaConfig {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PopupSizeConfig {
    pub width: i32,
    pub height: i32,
}

impl Default for PopupSizeConfig {
    fn default() -> Self {
        Self {
            width: 420,
            height: 220,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            master_enabled: true,
            auto_inject: false,
            humanize_typing: false,
            ultra_human: false,
            live_mode: false,
            coding_mode: false,
            tab_as_spaces: false,
            tone: "professional".to_string(),
            selected_agent: "default".to_string(),
            last_generated_text: String::new(),
            last_generated_explanation: String::new(),
            keylog_enabled: false,
            worker_command: vec!["python3".to_string(), "ai_backend_service.py".to_string()],
            injector_binary: String::new(),
            env_file: ".env".to_string(),
            hotkeys: default_hotkeys(),
            work_area: WorkAreaConfig::default(),
            popup: PopupSizeConfig::default(),
        }
    }
}

fn default_hotkeys() -> HashMap<String, String> {
    [
        ("toggle_overlay", "ctrl+alt+o"),
        ("paste_last", "ctrl+alt+p"),
        ("generate", "ctrl+alt+enter"),
        ("clipboard", "ctrl+alt+c"),
        ("screenshot", "ctrl+alt+s"),
        ("voice", "ctrl+alt+v"),
        ("settings", "ctrl+alt+k"),
        ("cancel", "ctrl+alt+x"),
        ("pause_resume", "ctrl+alt+r"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn action_for_name(name: &str) -> Option<HotkeyAction> {
    let action = match name {
        "toggle_overlay" => HotkeyAction::ToggleOverlay,
        "paste_last" => HotkeyAction::PasteLast,
        "generate" => HotkeyAction::Generate,
        "clipboard" => HotkeyAction::Clipboard,
        "screenshot" => HotkeyAction::Screenshot,
        "voice" => HotkeyAction::Voice,
        "settings" => HotkeyAction::Settings,
        "cancel" => HotkeyAction::Cancel,
        "pause_resume" => HotkeyAction::PauseResume,
        _ => return None,
    };
    Some(action)
}

impl Settings {
    /// Config directory: `~/.config/keyflow`.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyflow")
    }

    /// Data directory: `~/.local/share/keyflow`.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyflow")
    }

    pub fn settings_path() -> PathBuf {
        Self::config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Load from the default path; defaults on a missing file, errors only
    /// on unreadable content (exit code 2 territory).
    pub fn load() -> Result<Self, DaemonError> {
        Self::load_from(&Self::settings_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, DaemonError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| DaemonError::ConfigInvalid(format!("{:?}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DaemonError::ConfigInvalid(format!("{:?}: {}", path, e))),
        }
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::settings_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create config directory {:?}: {}", parent, e))?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| format!("serialize settings: {}", e))?;
        std::fs::write(path, contents).map_err(|e| format!("write settings {:?}: {}", path, e))
    }

    /// Resolve the hotkey table. Unknown actions or unparseable chords are
    /// configuration errors.
    pub fn bindings(&self) -> Result<HashMap<Chord, HotkeyAction>, DaemonError> {
        let mut bindings = HashMap::new();
        for (name, spec) in &self.hotkeys {
            let action = action_for_name(name).ok_or_else(|| {
                DaemonError::ConfigInvalid(format!("unknown hotkey action '{}'", name))
            })?;
            let chord = parse_chord(spec).map_err(DaemonError::ConfigInvalid)?;
            if bindings.insert(chord, action).is_some() {
                return Err(DaemonError::ConfigInvalid(format!(
                    "hotkey '{}' is bound twice",
                    spec
                )));
            }
        }
        Ok(bindings)
    }

    pub fn tone(&self) -> &str {
        if TONES.contains(&self.tone.as_str()) {
            &self.tone
        } else {
            "professional"
        }
    }

    pub fn work_area_rect(&self) -> Rect {
        Rect {
            x: self.work_area.x,
            y: self.work_area.y,
            width: self.work_area.width,
            height: self.work_area.height,
        }
    }

    pub fn popup_size(&self) -> Size {
        Size {
            width: self.popup.width,
            height: self.popup.height,
        }
    }

    pub fn env_file_path(&self) -> PathBuf {
        let p = PathBuf::from(&self.env_file);
        if p.is_absolute() {
            p
        } else {
            Self::config_dir().join(p)
        }
    }

    pub fn injector_binary_path(&self) -> PathBuf {
        if self.injector_binary.is_empty() {
            crate::inject::InjectorClient::sibling_binary()
        } else {
            PathBuf::from(&self.injector_binary)
        }
    }
}

/// The settings handler: the one place settings are written. Readers take
/// cheap snapshots; every write persists through to disk.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: std::sync::Arc<std::sync::Mutex<Settings>>,
    path: PathBuf,
}

impl SettingsHandle {
    pub fn new(settings: Settings, path: PathBuf) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(settings)),
            path,
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.lock().unwrap().clone()
    }

    /// Apply a mutation and persist. Failures to write are logged, not
    /// fatal; the in-memory state is still authoritative.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let snapshot = {
            let mut guard = self.inner.lock().unwrap();
            f(&mut guard);
            guard.clone()
        };
        if let Err(e) = snapshot.save_to(&self.path) {
            log::warn!("failed to persist settings: {}", e);
        }
    }

    pub fn set_last_output(&self, text: &str, explanation: Option<&str>) {
        self.update(|s| {
            s.last_generated_text = text.to_string();
            if let Some(explanation) = explanation {
                s.last_generated_explanation = explanation.to_string();
            }
        });
    }

    pub fn set_last_explanation(&self, text: &str) {
        self.update(|s| s.last_generated_explanation = text.to_string());
    }

    pub fn clear_last_output(&self) {
        self.update(|s| {
            s.last_generated_text.clear();
            s.last_generated_explanation.clear();
        });
    }
}

/// Everything a worker (re)start needs, assembled atomically by the
/// settings handler. Reloads during a live session do not touch it.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub settings: Settings,
    /// Resolved provider keys, by env-var name.
    pub provider_keys: Vec<(String, String)>,
    /// Capture-visibility of owned surfaces.
    pub capture: Vec<CaptureStatus>,
}

impl ConfigSnapshot {
    /// Resolve provider keys: process env, then env file, then key store.
    pub fn assemble(
        settings: &Settings,
        env_file: &HashMap<String, String>,
        keystore: &keystore::KeyStore,
        capture: &[CaptureStatus],
    ) -> Self {
        let mut provider_keys = Vec::new();
        for &name in PROVIDER_ENV_VARS {
            let value = std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| envfile::lookup(env_file, name).map(|v| v.to_string()))
                .or_else(|| keystore.get(name));
            if let Some(value) = value {
                provider_keys.push((name.to_string(), value));
            }
        }

        Self {
            settings: settings.clone(),
            provider_keys,
            capture: capture.to_vec(),
        }
    }

    pub fn has_any_provider_key(&self) -> bool {
        !self.provider_keys.is_empty()
    }

    /// Environment handed to the worker child.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env = self.provider_keys.clone();
        env.push((
            "KEYFLOW_AGENT".to_string(),
            self.settings.selected_agent.clone(),
        ));
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings::default();
        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{broken").unwrap();
        let err = Settings::load_from(&path).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn partial_settings_fill_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"auto_inject": true}"#).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert!(loaded.auto_inject);
        assert!(loaded.master_enabled);
        assert_eq!(loaded.tone, "professional");
    }

    #[test]
    fn default_bindings_parse_and_cover_all_actions() {
        let bindings = Settings::default().bindings().unwrap();
        assert_eq!(bindings.len(), HotkeyAction::ALL.len());
        assert!(bindings.values().any(|a| *a == HotkeyAction::Generate));
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut settings = Settings::default();
        settings
            .hotkeys
            .insert("cancel".into(), settings.hotkeys["generate"].clone());
        let err = settings.bindings().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unknown_tone_falls_back_to_professional() {
        let mut settings = Settings::default();
        settings.tone = "sarcastic".into();
        assert_eq!(settings.tone(), "professional");
        settings.tone = "casual".into();
        assert_eq!(settings.tone(), "casual");
    }

    #[test]
    fn snapshot_resolves_keys_from_env_file() {
        std::env::remove_var("MISTRAL_API_KEY");
        std::env::remove_var("OPENAI_API_KEY");
        let settings = Settings::default();
        let mut env_file = HashMap::new();
        env_file.insert("MISTRAL_API_KEY".to_string(), "file-key".to_string());
        env_file.insert("OPENAI_API_KEY".to_string(), "your-api-key-here".to_string());
        let dir = tempfile::tempdir().unwrap();
        let keystore = keystore::KeyStore::load(dir.path().join("keys.enc.json"));

        let snapshot = ConfigSnapshot::assemble(&settings, &env_file, &keystore, &[]);
        let keys: HashMap<_, _> = snapshot.provider_keys.iter().cloned().collect();
        assert_eq!(keys.get("MISTRAL_API_KEY").map(String::as_str), Some("file-key"));
        // Placeholder never resolves.
        assert!(!keys.contains_key("OPENAI_API_KEY"));
    }
}
