//! Project name → working directory cache.
//!
//! Deriving a project's directory means scanning its conversation logs, so
//! results are cached here. The watcher invalidates entries for any project
//! it sees touched; nothing is assumed valid forever.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
pub struct ProjectPathCache {
    entries: RwLock<HashMap<String, PathBuf>>,
}

impl ProjectPathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<PathBuf> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn insert(&self, name: &str, path: PathBuf) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), path);
    }

    /// Returns whether an entry was present.
    pub fn invalidate(&self, name: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
