//! The Source Provider: disk reads shadowed by an in-memory
//! overlay, so unsaved LSP edits compile without touching the filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::TypedownError;

/// Composes a disk backend with an overlay map; the overlay wins when
/// present. An optional memory-only mode (no `disk_root`) rejects disk
/// access entirely, for hydrating a fresh project from a single bulk
/// `loadProject` message.
pub struct SourceProvider {
    disk_root: Option<PathBuf>,
    overlay: RwLock<BTreeMap<PathBuf, String>>,
}

impl SourceProvider {
    /// A provider backed by disk at `root`, with an empty overlay.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SourceProvider {
            disk_root: Some(root.into()),
            overlay: RwLock::new(BTreeMap::new()),
        }
    }

    /// A provider with no disk backend: only overlay entries are visible.
    pub fn memory_only() -> Self {
        SourceProvider {
            disk_root: None,
            overlay: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        if self.overlay.read().contains_key(path) {
            return true;
        }
        self.disk_root.is_some() && path.exists()
    }

    pub fn get_content(&self, path: &Path) -> Result<String, TypedownError> {
        if let Some(text) = self.overlay.read().get(path) {
            return Ok(text.clone());
        }
        if self.disk_root.is_none() {
            return Err(TypedownError::NotFound(format!(
                "{} (memory-only source provider)",
                path.display()
            )));
        }
        std::fs::read_to_string(path).map_err(TypedownError::from)
    }

    /// Replaces (or inserts) the overlay entry for `path`.
    pub fn update_overlay(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
        self.overlay.write().insert(path.into(), text.into());
    }

    /// Bulk-hydrates the overlay, replacing any existing entries that share
    /// a path. Used by the `typedown/loadProject` LSP notification.
    pub fn load_project(&self, files: impl IntoIterator<Item = (PathBuf, String)>) {
        let mut overlay = self.overlay.write();
        overlay.extend(files);
    }

    /// Drops every overlay entry, reverting to disk content everywhere.
    pub fn clear_overlay(&self) {
        self.overlay.write().clear();
    }

    pub fn remove_overlay(&self, path: &Path) {
        self.overlay.write().remove(path);
    }

    pub fn root(&self) -> Option<&Path> {
        self.disk_root.as_deref()
    }

    /// Every path currently shadowed in the overlay, for scanner discovery
    /// against purely in-memory or virtual-workspace projects where
    /// walking the real filesystem finds nothing.
    pub fn overlay_paths(&self) -> Vec<PathBuf> {
        self.overlay.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn overlay_shadows_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.td");
        std::fs::write(&file, "disk content").unwrap();

        let provider = SourceProvider::new(dir.path());
        assert_eq!(provider.get_content(&file).unwrap(), "disk content");

        provider.update_overlay(file.clone(), "overlay content");
        assert_eq!(provider.get_content(&file).unwrap(), "overlay content");

        provider.clear_overlay();
        assert_eq!(provider.get_content(&file).unwrap(), "disk content");
    }

    #[test]
    fn memory_only_rejects_disk_access() {
        let provider = SourceProvider::memory_only();
        let path = PathBuf::from("/does/not/matter.td");
        assert!(provider.get_content(&path).is_err());
        provider.update_overlay(path.clone(), "hello");
        assert_eq!(provider.get_content(&path).unwrap(), "hello");
    }
}
