//! JSON-array project store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;

use super::ProjectSource;

/// A saved project: an arbitrary JSON object with a string `id`.
pub type Project = Map<String, Value>;

/// Saved projects, most recently saved first.
#[derive(Debug)]
pub struct ProjectStore {
    path: PathBuf,
    projects: Mutex<Vec<Project>>,
}

impl ProjectStore {
    /// Opens the store at `path`.
    ///
    /// A missing or unreadable file, or one that is not a JSON array, opens
    /// as an empty store. Entries that are not objects are dropped.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let projects = load(&path);
        debug!(path = %path.display(), count = projects.len(), "Loaded projects");
        Self {
            path,
            projects: Mutex::new(projects),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Project>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All projects, most recent first.
    pub fn list(&self) -> Vec<Project> {
        self.lock().clone()
    }

    /// Returns the project with `id`, if saved.
    pub fn get(&self, id: &str) -> Option<Project> {
        self.lock()
            .iter()
            .find(|p| project_id(p).as_deref() == Some(id))
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Saves `payload` as the most recent project.
    ///
    /// A missing or empty `id` gets a fresh UUID. Any earlier project with
    /// the same id is replaced.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPayload` if `payload` is not a JSON object,
    /// or an IO/JSON error if the file cannot be written.
    pub fn upsert(&self, payload: Value) -> Result<Project, StoreError> {
        let Value::Object(mut project) = payload else {
            return Err(StoreError::InvalidPayload {
                what: "project",
                reason: "expected a JSON object".to_string(),
            });
        };

        let id = match project_id(&project) {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        project.insert("id".to_string(), Value::String(id.clone()));

        let mut projects = self.lock();
        projects.retain(|p| project_id(p).as_deref() != Some(id.as_str()));
        projects.insert(0, project.clone());
        save(&self.path, &projects)?;

        debug!(project_id = %id, "Project saved");
        Ok(project)
    }

    /// Removes the project with `id`. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut projects = self.lock();
        let before = projects.len();
        projects.retain(|p| project_id(p).as_deref() != Some(id));
        if projects.len() == before {
            return Ok(false);
        }
        save(&self.path, &projects)?;
        Ok(true)
    }

    /// Removes every project and returns the ids that were saved.
    pub fn clear(&self) -> Result<Vec<String>, StoreError> {
        let mut projects = self.lock();
        let ids = projects.iter().filter_map(project_id).collect();
        projects.clear();
        save(&self.path, &projects)?;
        Ok(ids)
    }

    /// Identifiers of all saved projects.
    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().filter_map(project_id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl ProjectSource for ProjectStore {
    fn project_ids(&self) -> Vec<String> {
        self.ids()
    }

    fn project_count(&self) -> usize {
        self.len()
    }
}

/// String form of a project's `id`; numeric ids are accepted.
fn project_id(project: &Project) -> Option<String> {
    match project.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn load(path: &Path) -> Vec<Project> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(mut project) => {
                    if let Some(id) = project_id(&project) {
                        project.insert("id".to_string(), Value::String(id));
                    }
                    Some(project)
                }
                _ => None,
            })
            .collect(),
        Ok(_) => {
            warn!(path = %path.display(), "Projects file is not a JSON array, ignoring");
            Vec::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Projects file is not valid JSON, ignoring");
            Vec::new()
        }
    }
}

fn save(path: &Path, projects: &[Project]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(projects)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_and_invalid_files_open_empty() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(ProjectStore::open(tmp.path().join("none.json")).is_empty());

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{not json").expect("write");
        assert!(ProjectStore::open(&bad).is_empty());

        let object = tmp.path().join("object.json");
        std::fs::write(&object, r#"{"id": "x"}"#).expect("write");
        assert!(ProjectStore::open(&object).is_empty());
    }

    #[test]
    fn test_upsert_orders_and_dedupes() {
        let tmp = TempDir::new().expect("tempdir");
        let store = ProjectStore::open(tmp.path().join("projects.json"));

        store.upsert(json!({"id": "a", "name": "first"})).expect("save a");
        store.upsert(json!({"id": "b"})).expect("save b");
        store.upsert(json!({"id": "a", "name": "renamed"})).expect("resave a");

        assert_eq!(store.ids(), vec!["a", "b"]);
        assert_eq!(store.get("a").expect("a")["name"], json!("renamed"));

        let reopened = ProjectStore::open(store.path());
        assert_eq!(reopened.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_upsert_generates_id() {
        let tmp = TempDir::new().expect("tempdir");
        let store = ProjectStore::open(tmp.path().join("projects.json"));

        let saved = store.upsert(json!({"name": "untitled"})).expect("save");
        let id = saved["id"].as_str().expect("id");
        assert!(Uuid::parse_str(id).is_ok());

        let saved = store.upsert(json!({"id": "", "name": "blank"})).expect("save");
        assert_ne!(saved["id"], json!(""));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_upsert_rejects_non_objects() {
        let tmp = TempDir::new().expect("tempdir");
        let store = ProjectStore::open(tmp.path().join("projects.json"));
        let err = store.upsert(json!([1, 2])).expect_err("invalid");
        assert!(matches!(err, StoreError::InvalidPayload { what: "project", .. }));
    }

    #[test]
    fn test_numeric_ids_normalized() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("projects.json");
        std::fs::write(&path, r#"[{"id": 42, "name": "n"}, "junk", {"name": "no id"}]"#)
            .expect("write");

        let store = ProjectStore::open(&path);
        assert_eq!(store.len(), 2);
        assert_eq!(store.ids(), vec!["42"]);
        assert!(store.remove("42").expect("remove"));
    }

    #[test]
    fn test_remove_and_clear() {
        let tmp = TempDir::new().expect("tempdir");
        let store = ProjectStore::open(tmp.path().join("projects.json"));
        store.upsert(json!({"id": "a"})).expect("save");
        store.upsert(json!({"id": "b"})).expect("save");

        assert!(!store.remove("zzz").expect("remove"));
        assert!(store.remove("a").expect("remove"));
        assert_eq!(store.project_ids(), vec!["b"]);

        let cleared = store.clear().expect("clear");
        assert_eq!(cleared, vec!["b"]);
        assert!(ProjectStore::open(store.path()).is_empty());
    }
}
