//! Capture-exempt surface registry.
//!
//! Owned windows (popup, explanation, overlay) should be invisible to
//! screen-sharing consumers. On KDE/Wayland that is a KWin window rule per
//! surface class; elsewhere no facility exists, the surface is created
//! anyway, and the ConfigSnapshot marks it capture-visible so the worker
//! side can tell the user.
//!
//! The injector's echo-suppression window is unrelated to this module; it
//! is an internal tag stream, not a window property.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;

/// Outcome of registering one surface.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CaptureStatus {
    pub surface_class: String,
    pub exempt: bool,
    pub detail: String,
}

/// Registry of owned surfaces and their capture exemption state.
pub struct CaptureRegistry {
    rules_path: Option<PathBuf>,
    applicable: bool,
    statuses: Vec<CaptureStatus>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        let applicable = is_wayland() && is_kde();
        Self {
            rules_path: kwinrulesrc_path(),
            applicable,
            statuses: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_rules_path(path: PathBuf) -> Self {
        Self {
            rules_path: Some(path),
            applicable: true,
            statuses: Vec::new(),
        }
    }

    /// Register one owned surface. Returns its status, also retained for
    /// the ConfigSnapshot.
    pub fn register(&mut self, surface_class: &str) -> CaptureStatus {
        let status = if !self.applicable {
            CaptureStatus {
                surface_class: surface_class.to_string(),
                exempt: false,
                detail: "no capture-exclusion facility on this desktop".into(),
            }
        } else {
            match self.install_rule(surface_class) {
                Ok(()) => CaptureStatus {
                    surface_class: surface_class.to_string(),
                    exempt: true,
                    detail: "kwin window rule installed".into(),
                },
                Err(e) => {
                    log::warn!("capture exemption for '{}' failed: {}", surface_class, e);
                    CaptureStatus {
                        surface_class: surface_class.to_string(),
                        exempt: false,
                        detail: e,
                    }
                }
            }
        };

        if !status.exempt {
            log::warn!(
                "surface '{}' is capture-visible: {}",
                surface_class,
                status.detail
            );
        }

        self.statuses.push(status.clone());
        status
    }

    /// All registered surfaces, for the ConfigSnapshot.
    pub fn statuses(&self) -> &[CaptureStatus] {
        &self.statuses
    }

    /// Remove every rule this registry installed (shutdown path).
    pub fn unregister_all(&mut self) {
        if !self.applicable {
            self.statuses.clear();
            return;
        }
        for status in std::mem::take(&mut self.statuses) {
            if status.exempt {
                if let Err(e) = self.remove_rule(&status.surface_class) {
                    log::warn!("failed to remove rule for '{}': {}", status.surface_class, e);
                }
            }
        }
        let _ = reload_kwin();
    }

    fn install_rule(&self, surface_class: &str) -> Result<(), String> {
        let path = self
            .rules_path
            .as_ref()
            .ok_or("could not determine config directory")?;

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(format!(
                    "cannot read existing kwinrulesrc at {:?}: {}",
                    path, e
                ));
            }
        };

        let mut sections = parse_ini(&content);
        let rule_id = rule_id_for(surface_class);

        let general = sections.entry("General".to_string()).or_default();
        let mut rules_list: Vec<String> = general
            .get("rules")
            .map(|r| r.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        if !rules_list.contains(&rule_id) {
            rules_list.push(rule_id.clone());
        }
        general.insert("count".to_string(), rules_list.len().to_string());
        general.insert("rules".to_string(), rules_list.join(","));

        let mut rule: HashMap<String, String> = HashMap::new();
        rule.insert(
            "Description".to_string(),
            format!("keyflow surface '{}': no capture, no focus", surface_class),
        );
        rule.insert("above".to_string(), "true".to_string());
        rule.insert("aboverule".to_string(), "2".to_string());
        rule.insert("acceptfocus".to_string(), "false".to_string());
        rule.insert("acceptfocusrule".to_string(), "2".to_string());
        rule.insert("skiptaskbar".to_string(), "true".to_string());
        rule.insert("skiptaskbarrule".to_string(), "2".to_string());
        rule.insert("skipswitcher".to_string(), "true".to_string());
        rule.insert("skipswitcherrule".to_string(), "2".to_string());
        rule.insert("wmclass".to_string(), surface_class.to_string());
        rule.insert("wmclassmatch".to_string(), "1".to_string());
        sections.insert(rule_id, rule);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create config directory: {}", e))?;
        }
        std::fs::write(path, serialize_ini(&sections))
            .map_err(|e| format!("failed to write kwinrulesrc: {}", e))?;

        reload_kwin()
    }

    fn remove_rule(&self, surface_class: &str) -> Result<(), String> {
        let path = self
            .rules_path
            .as_ref()
            .ok_or("could not determine config directory")?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read kwinrulesrc: {}", e))?;

        let mut sections = parse_ini(&content);
        let rule_id = rule_id_for(surface_class);
        sections.remove(&rule_id);

        if let Some(general) = sections.get_mut("General") {
            if let Some(rules) = general.get("rules") {
                let rules_list: Vec<String> = rules
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|r| r != &rule_id)
                    .collect();
                general.insert("count".to_string(), rules_list.len().to_string());
                general.insert("rules".to_string(), rules_list.join(","));
            }
        }

        std::fs::write(path, serialize_ini(&sections))
            .map_err(|e| format!("failed to write kwinrulesrc: {}", e))
    }
}

impl Default for CaptureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn rule_id_for(surface_class: &str) -> String {
    format!("keyflow-{}", surface_class)
}

fn is_wayland() -> bool {
    if let Ok(session_type) = std::env::var("XDG_SESSION_TYPE") {
        if session_type.to_lowercase() == "wayland" {
            return true;
        }
    }
    std::env::var("WAYLAND_DISPLAY").is_ok()
}

fn is_kde() -> bool {
    if let Ok(desktop) = std::env::var("XDG_CURRENT_DESKTOP") {
        if desktop.to_uppercase().contains("KDE") {
            return true;
        }
    }
    std::env::var("KDE_SESSION_VERSION").is_ok()
}

fn kwinrulesrc_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kwinrulesrc"))
}

/// Minimal INI parser for kwinrulesrc.
fn parse_ini(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].to_string();
            sections.entry(current.clone()).or_default();
        } else if let Some((key, value)) = line.split_once('=') {
            if !current.is_empty() {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }

    sections
}

fn serialize_ini(sections: &HashMap<String, HashMap<String, String>>) -> String {
    let mut output = String::new();

    if let Some(general) = sections.get("General") {
        output.push_str("[General]\n");
        if let Some(count) = general.get("count") {
            output.push_str(&format!("count={}\n", count));
        }
        if let Some(rules) = general.get("rules") {
            output.push_str(&format!("rules={}\n", rules));
        }
        for (key, value) in general {
            if key != "count" && key != "rules" {
                output.push_str(&format!("{}={}\n", key, value));
            }
        }
        output.push('\n');
    }

    let mut names: Vec<_> = sections.keys().filter(|n| *n != "General").collect();
    names.sort();
    for name in names {
        output.push_str(&format!("[{}]\n", name));
        let section = &sections[name];
        if let Some(desc) = section.get("Description") {
            output.push_str(&format!("Description={}\n", desc));
        }
        let mut keys: Vec<_> = section.keys().filter(|k| *k != "Description").collect();
        keys.sort();
        for key in keys {
            output.push_str(&format!("{}={}\n", key, section[key]));
        }
        output.push('\n');
    }

    output
}

fn reload_kwin() -> Result<(), String> {
    // qdbus6 on Plasma 6, qdbus on Plasma 5.
    for tool in ["qdbus6", "qdbus"] {
        match Command::new(tool)
            .args(["org.kde.KWin", "/KWin", "reconfigure"])
            .output()
        {
            Ok(output) if output.status.success() => {
                log::debug!("KWin reconfigured via {}", tool);
                return Ok(());
            }
            Ok(output) => {
                log::debug!(
                    "{} failed (exit {})",
                    tool,
                    output.status.code().unwrap_or(-1)
                );
            }
            Err(e) => log::debug!("{} not available: {}", tool, e),
        }
    }
    Err("no working D-Bus tool to reload KWin".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_sections() {
        let content = "[General]\ncount=1\nrules=keyflow-popup\n\n[keyflow-popup]\nDescription=x\nwmclass=keyflow-popup\n";
        let sections = parse_ini(content);
        assert_eq!(
            sections["General"].get("rules"),
            Some(&"keyflow-popup".to_string())
        );
        let out = serialize_ini(&sections);
        let reparsed = parse_ini(&out);
        assert_eq!(sections, reparsed);
    }

    #[test]
    fn register_installs_rule_and_preserves_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kwinrulesrc");
        std::fs::write(&path, "[General]\ncount=1\nrules=someone-else\n\n[someone-else]\nwmclass=other\n").unwrap();

        let mut registry = CaptureRegistry::with_rules_path(path.clone());
        let status = registry.register("popup");
        // The rule write succeeds even when the KWin reload cannot run in
        // this environment; exemption then reports the reload failure.
        let content = std::fs::read_to_string(&path).unwrap();
        let sections = parse_ini(&content);
        assert!(sections.contains_key("keyflow-popup"));
        assert!(sections.contains_key("someone-else"));
        let rules = sections["General"].get("rules").unwrap();
        assert!(rules.contains("someone-else"));
        assert!(rules.contains("keyflow-popup"));
        assert_eq!(status.surface_class, "popup");
    }

    #[test]
    fn rule_keys_disable_focus_and_capture_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kwinrulesrc");
        let mut registry = CaptureRegistry::with_rules_path(path.clone());
        registry.register("popup");

        let sections = parse_ini(&std::fs::read_to_string(&path).unwrap());
        let rule = &sections["keyflow-popup"];
        assert_eq!(rule.get("acceptfocus"), Some(&"false".to_string()));
        assert_eq!(rule.get("skipswitcher"), Some(&"true".to_string()));
        assert_eq!(rule.get("above"), Some(&"true".to_string()));
        assert_eq!(rule.get("wmclass"), Some(&"popup".to_string()));
    }
}
