//! Persisted user state: saved projects and application settings.
//!
//! Both are small JSON files rewritten on every mutation. Project records
//! are free-form objects; the only field this crate interprets is `id`,
//! which names the output directory a project keeps alive.

pub mod settings;
pub mod store;

pub use settings::SettingsStore;
pub use store::{Project, ProjectStore};

/// Supplies the identifiers of saved projects.
pub trait ProjectSource: Send + Sync {
    /// Identifiers of all saved projects, as strings.
    fn project_ids(&self) -> Vec<String>;

    /// Number of saved projects.
    fn project_count(&self) -> usize {
        self.project_ids().len()
    }
}

/// Fixed project list, for callers that have no store.
impl ProjectSource for Vec<String> {
    fn project_ids(&self) -> Vec<String> {
        self.clone()
    }
}
