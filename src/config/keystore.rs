//! Provider API key store.
//!
//! Secret values live in the OS credential facility (keyring); the on-disk
//! `keys.enc.json` maps provider env-var name to a base64 entry handle.
//! When the credential facility is unavailable the entry degrades to
//! `{"plaintext": ...}` and startup logs a warning.
//!
//! Never log key values; display uses the masked form.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

const SERVICE_NAME: &str = "keyflow";

pub const KEYSTORE_FILE_NAME: &str = "keys.enc.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeyEntry {
    /// base64 handle of the keyring entry holding the value.
    Encrypted { encrypted: String },
    /// Fallback when no credential facility exists.
    Plaintext { plaintext: String },
}

#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    entries: BTreeMap<String, KeyEntry>,
}

impl KeyStore {
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, KeyEntry>>(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("key store {:?} unreadable, starting empty: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!("failed to read key store {:?}: {}", path, e);
                BTreeMap::new()
            }
        };

        let store = Self { path, entries };
        for (name, entry) in &store.entries {
            if matches!(entry, KeyEntry::Plaintext { .. }) {
                log::warn!(
                    "key store entry '{}' is stored in plaintext (no OS credential facility)",
                    name
                );
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Resolve one provider key. Errors are logged and collapse to None so
    /// a broken keyring degrades to "key unset".
    pub fn get(&self, name: &str) -> Option<String> {
        match self.entries.get(name)? {
            KeyEntry::Plaintext { plaintext } => {
                if plaintext.is_empty() {
                    None
                } else {
                    Some(plaintext.clone())
                }
            }
            KeyEntry::Encrypted { encrypted } => {
                let handle = match BASE64.decode(encrypted) {
                    Ok(bytes) => match String::from_utf8(bytes) {
                        Ok(s) => s,
                        Err(_) => {
                            log::warn!("key store entry '{}' has a non-UTF8 handle", name);
                            return None;
                        }
                    },
                    Err(e) => {
                        log::warn!("key store entry '{}' has a bad handle: {}", name, e);
                        return None;
                    }
                };
                match keyring::Entry::new(SERVICE_NAME, &handle) {
                    Ok(entry) => match entry.get_password() {
                        Ok(value) if !value.is_empty() => Some(value),
                        Ok(_) => None,
                        Err(keyring::Error::NoEntry) => None,
                        Err(e) => {
                            log::warn!("keyring lookup for '{}' failed: {}", name, e);
                            None
                        }
                    },
                    Err(e) => {
                        log::warn!("keyring entry for '{}' unavailable: {}", name, e);
                        None
                    }
                }
            }
        }
    }

    /// Store a key, preferring the credential facility. Pass an empty
    /// value to delete.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        if value.is_empty() {
            self.delete(name)?;
            return self.save();
        }

        match keyring::Entry::new(SERVICE_NAME, name) {
            Ok(entry) => match entry.set_password(value) {
                Ok(()) => {
                    self.entries.insert(
                        name.to_string(),
                        KeyEntry::Encrypted {
                            encrypted: BASE64.encode(name.as_bytes()),
                        },
                    );
                    log::info!("stored key '{}' via OS credential facility", name);
                }
                Err(e) => {
                    log::warn!(
                        "credential facility rejected '{}' ({}); falling back to plaintext",
                        name,
                        e
                    );
                    self.entries.insert(
                        name.to_string(),
                        KeyEntry::Plaintext {
                            plaintext: value.to_string(),
                        },
                    );
                }
            },
            Err(e) => {
                log::warn!(
                    "no credential facility for '{}' ({}); falling back to plaintext",
                    name,
                    e
                );
                self.entries.insert(
                    name.to_string(),
                    KeyEntry::Plaintext {
                        plaintext: value.to_string(),
                    },
                );
            }
        }

        self.save()
    }

    pub fn delete(&mut self, name: &str) -> Result<(), String> {
        if let Some(KeyEntry::Encrypted { .. }) = self.entries.remove(name) {
            if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
                match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(e) => return Err(format!("failed to delete credential '{}': {}", name, e)),
                }
            }
        }
        Ok(())
    }

    /// Masked form for display, e.g. `sk-...abc123`.
    pub fn masked(&self, name: &str) -> Option<String> {
        self.get(name).map(|key| {
            if key.len() <= 8 {
                "*".repeat(key.len())
            } else {
                format!("{}...{}", &key[..3], &key[key.len() - 6..])
            }
        })
    }

    fn save(&self) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create key store directory: {}", e))?;
        }
        let contents = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| format!("failed to serialize key store: {}", e))?;
        std::fs::write(&self.path, contents)
            .map_err(|e| format!("failed to write key store {:?}: {}", self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join(KEYSTORE_FILE_NAME));
        assert_eq!(store.names().count(), 0);
        assert_eq!(store.get("MISTRAL_API_KEY"), None);
    }

    #[test]
    fn plaintext_entries_round_trip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEYSTORE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"MISTRAL_API_KEY":{"plaintext":"test-key-value"}}"#,
        )
        .unwrap();

        let store = KeyStore::load(path);
        assert_eq!(store.get("MISTRAL_API_KEY").unwrap(), "test-key-value");
    }

    #[test]
    fn empty_plaintext_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEYSTORE_FILE_NAME);
        std::fs::write(&path, r#"{"OPENAI_API_KEY":{"plaintext":""}}"#).unwrap();
        let store = KeyStore::load(path);
        assert_eq!(store.get("OPENAI_API_KEY"), None);
    }

    #[test]
    fn corrupt_store_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEYSTORE_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();
        let store = KeyStore::load(path);
        assert_eq!(store.names().count(), 0);
    }

    #[test]
    fn masked_display_hides_the_middle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEYSTORE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"MISTRAL_API_KEY":{"plaintext":"sk-abcdefghijklmnop"}}"#,
        )
        .unwrap();
        let store = KeyStore::load(path);
        let masked = store.masked("MISTRAL_API_KEY").unwrap();
        assert!(masked.starts_with("sk-"));
        assert!(masked.contains("..."));
        assert!(!masked.contains("abcdefghij"));
    }

    #[test]
    fn entry_json_shapes_match_the_wire_contract() {
        let encrypted: KeyEntry = serde_json::from_str(r#"{"encrypted":"TUlTVFJBTA=="}"#).unwrap();
        assert!(matches!(encrypted, KeyEntry::Encrypted { .. }));
        let plaintext: KeyEntry = serde_json::from_str(r#"{"plaintext":"x"}"#).unwrap();
        assert!(matches!(plaintext, KeyEntry::Plaintext { .. }));
    }
}
