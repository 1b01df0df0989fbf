//! JSON-object settings store merged over built-in defaults.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::DEFAULT_MODEL;
use crate::error::StoreError;

/// Built-in settings. Stored values override these key by key.
pub fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        "model": DEFAULT_MODEL,
        "stems": "4",
        "format": "wav",
        "sampleRate": "44100",
        "bitDepth": "24",
        "mono": false,
        "autoPlay": true,
        "showTimescale": true,
        "theme": "dark",
        "apiUrl": "http://localhost:8000",
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Application settings persisted as one JSON object.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    /// Opens the store at `path`, falling back to defaults when the file is
    /// missing or is not a JSON object. Unknown keys are kept.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut settings = default_settings();
        match std::fs::read_to_string(&path).map(|raw| serde_json::from_str::<Value>(&raw)) {
            Ok(Ok(Value::Object(stored))) => settings.extend(stored),
            Ok(Ok(_)) | Ok(Err(_)) => {
                warn!(path = %path.display(), "Settings file is not a JSON object, using defaults");
            }
            Err(_) => debug!(path = %path.display(), "No settings file, using defaults"),
        }
        Self {
            path,
            settings: Mutex::new(settings),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings.
    pub fn get(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    /// Merges `patch` into the settings, persists them and returns the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPayload` if `patch` is not a JSON object.
    pub fn update(&self, patch: Value) -> Result<Map<String, Value>, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidPayload {
                what: "settings",
                reason: "expected a JSON object".to_string(),
            });
        };

        let mut settings = self.lock();
        settings.extend(patch);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&*settings)?)?;
        Ok(settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let tmp = TempDir::new().expect("tempdir");
        let store = SettingsStore::open(tmp.path().join("config/settings.json"));
        let settings = store.get();
        assert_eq!(settings["model"], json!("htdemucs"));
        assert_eq!(settings["stems"], json!("4"));
        assert_eq!(settings["mono"], json!(false));
        assert_eq!(settings["apiUrl"], json!("http://localhost:8000"));
        assert_eq!(settings.len(), 10);
    }

    #[test]
    fn test_stored_values_override_and_unknown_keys_survive() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"theme": "light", "volume": 0.7}"#).expect("write");

        let settings = SettingsStore::open(&path).get();
        assert_eq!(settings["theme"], json!("light"));
        assert_eq!(settings["volume"], json!(0.7));
        assert_eq!(settings["format"], json!("wav"));
    }

    #[test]
    fn test_non_object_file_uses_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "[1, 2, 3]").expect("write");
        assert_eq!(SettingsStore::open(&path).get(), default_settings());
    }

    #[test]
    fn test_update_persists() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config/settings.json");
        let store = SettingsStore::open(&path);

        let updated = store.update(json!({"model": "mdx", "extra": [1]})).expect("update");
        assert_eq!(updated["model"], json!("mdx"));

        let reopened = SettingsStore::open(&path).get();
        assert_eq!(reopened["model"], json!("mdx"));
        assert_eq!(reopened["extra"], json!([1]));
    }

    #[test]
    fn test_update_rejects_non_objects() {
        let tmp = TempDir::new().expect("tempdir");
        let store = SettingsStore::open(tmp.path().join("settings.json"));
        let err = store.update(json!("dark")).expect_err("invalid");
        assert!(matches!(err, StoreError::InvalidPayload { what: "settings", .. }));
    }
}
