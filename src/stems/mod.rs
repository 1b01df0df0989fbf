//! Stem naming, extension policy and stem resolution.
//!
//! A stem is one isolated track written by the separation engine as
//! `{stem}.{ext}`. Which file wins when the same stem exists in several
//! formats is decided by an explicit [`ExtensionPriority`], never by
//! iteration order.

pub mod resolver;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::jobs::StemMap;

pub use resolver::StemResolver;

/// The four stems every separation is expected to produce.
pub const CANONICAL_STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];

/// Additional file names recognised during filesystem recovery, with the key
/// each one is reported under.
pub const STEM_ALIASES: [(&str, &str); 3] = [
    ("no_vocals", "other"),
    ("guitar", "guitar"),
    ("piano", "piano"),
];

/// Ordered list of audio extensions; earlier entries win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPriority {
    extensions: Vec<String>,
}

impl Default for ExtensionPriority {
    /// Lossless formats first: `wav`, `flac`, then `mp3`.
    fn default() -> Self {
        Self::new(["wav", "flac", "mp3"])
    }
}

impl ExtensionPriority {
    /// Creates a policy from extensions in descending preference.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Extensions in descending preference.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Rank of `ext` (0 is best), or `None` when the extension is not audio
    /// this policy knows about.
    pub fn rank(&self, ext: &str) -> Option<usize> {
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().position(|e| *e == ext)
    }
}

/// Probes `dir` (non-recursively) for each canonical stem and records the
/// highest-priority file found per stem.
pub fn probe_stem_dir(dir: &Path, priority: &ExtensionPriority) -> StemMap {
    let mut stems = StemMap::new();
    for stem in CANONICAL_STEMS {
        for ext in priority.extensions() {
            let candidate = dir.join(format!("{}.{}", stem, ext));
            if candidate.is_file() {
                stems.insert(stem.to_string(), candidate);
                break;
            }
        }
    }
    stems
}

/// Media type served for a stem file.
pub fn media_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("wav") => "audio/wav",
        _ => "audio/mpeg",
    }
}
