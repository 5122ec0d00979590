//! The Symbol Table: a scoped index for `Id` lookup and a
//! global index for `Hash` lookup, plus the deterministic content-hashing
//! scheme entities are keyed by.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::diagnostic::{Diagnostic, DiagnosticReport, ErrorCode};
use crate::document::{Document, EntityBlock, ModelBlock, SourceLocation};

/// A lightweight pointer into the document store: which file, which list,
/// which index. Kept separate from the data itself so the validator can
/// still mutate `EntityBlock::resolved_data` through `&mut Document` after
/// the symbol table has been built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockRef {
    Model { path_id: usize, index: usize },
    Entity { path_id: usize, index: usize },
}

/// Either half of a resolved [`BlockRef`], returned by lookup.
pub enum Resolved<'a> {
    Model(&'a ModelBlock),
    Entity(&'a EntityBlock),
}

impl<'a> Resolved<'a> {
    pub fn location(&self) -> &'a SourceLocation {
        match self {
            Resolved::Model(m) => &m.location,
            Resolved::Entity(e) => &e.location,
        }
    }

    pub fn as_entity(&self) -> Option<&'a EntityBlock> {
        match self {
            Resolved::Entity(e) => Some(e),
            Resolved::Model(_) => None,
        }
    }
}

/// The document store the symbol table's refs are resolved against. Paths
/// are interned to small integer ids so `BlockRef` stays `Copy` and cheap
/// to store by the thousand.
pub struct DocumentStore {
    paths: Vec<PathBuf>,
    path_ids: BTreeMap<PathBuf, usize>,
    documents: BTreeMap<usize, Document>,
}

impl DocumentStore {
    pub fn new() -> Self {
        DocumentStore {
            paths: Vec::new(),
            path_ids: BTreeMap::new(),
            documents: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, document: Document) -> usize {
        let path = document.path.clone();
        let id = *self.path_ids.entry(path.clone()).or_insert_with(|| {
            self.paths.push(path);
            self.paths.len() - 1
        });
        self.documents.insert(id, document);
        id
    }

    pub fn path_id(&self, path: &Path) -> Option<usize> {
        self.path_ids.get(path).copied()
    }

    pub fn path(&self, path_id: usize) -> &Path {
        &self.paths[path_id]
    }

    pub fn get(&self, path_id: usize) -> Option<&Document> {
        self.documents.get(&path_id)
    }

    pub fn get_mut(&mut self, path_id: usize) -> Option<&mut Document> {
        self.documents.get_mut(&path_id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn documents_mut(&mut self) -> impl Iterator<Item = &mut Document> {
        self.documents.values_mut()
    }

    pub fn resolve<'a>(&'a self, block_ref: BlockRef) -> Option<Resolved<'a>> {
        match block_ref {
            BlockRef::Model { path_id, index } => self
                .get(path_id)
                .and_then(|d| d.models.get(index))
                .map(Resolved::Model),
            BlockRef::Entity { path_id, index } => self
                .get(path_id)
                .and_then(|d| d.entities.get(index))
                .map(Resolved::Entity),
        }
    }

    pub fn resolve_entity_mut(&mut self, block_ref: BlockRef) -> Option<&mut EntityBlock> {
        match block_ref {
            BlockRef::Entity { path_id, index } => {
                self.get_mut(path_id).and_then(|d| d.entities.get_mut(index))
            }
            BlockRef::Model { .. } => None,
        }
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical content hash of an entity: SHA-256 over a
/// canonical serialisation of id, class name, and raw_data. `serde_json`'s
/// default map representation (a `BTreeMap`, since the `preserve_order`
/// feature is not enabled) already sorts object keys, so a direct
/// `to_string` of `{class, data, id}` is canonical without extra work.
pub fn compute_content_hash(id: &str, class_name: &str, raw_data: &Value) -> String {
    let canonical = serde_json::json!({
        "id": id,
        "class": class_name,
        "data": raw_data,
    });
    let bytes = serde_json::to_vec(&canonical).expect("json values always serialize");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

/// The scoped index (`(scope_path, name) -> Block`) and global index
/// (`content_hash -> Block`).
#[derive(Default)]
pub struct SymbolTable {
    scoped: BTreeMap<(PathBuf, String), BlockRef>,
    global: BTreeMap<String, BlockRef>,
    models: Vec<BlockRef>,
    entities: Vec<BlockRef>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `block_ref` under `(scope_dir, name)`. Returns `Err` with an
    /// `E0241` diagnostic (not pushed by this function — the caller decides
    /// where to attach it) if the scope already holds that name: ids must
    /// be unique within their lexical scope.
    pub fn register(
        &mut self,
        name: &str,
        scope_dir: PathBuf,
        hash: Option<String>,
        block_ref: BlockRef,
    ) -> Result<(), ()> {
        let key = (scope_dir, name.to_string());
        if self.scoped.contains_key(&key) {
            return Err(());
        }
        self.scoped.insert(key, block_ref);
        if let Some(hash) = hash {
            self.global.entry(hash).or_insert(block_ref);
        }
        match block_ref {
            BlockRef::Model { .. } => self.models.push(block_ref),
            BlockRef::Entity { .. } => self.entities.push(block_ref),
        }
        Ok(())
    }

    /// Looks up `name` starting from `context_path`'s directory and walking
    /// upward toward `project_root`, returning the first hit.
    pub fn resolve_id(
        &self,
        name: &str,
        context_path: &Path,
        project_root: &Path,
    ) -> Option<BlockRef> {
        let mut dir: &Path = context_path.parent().unwrap_or(context_path);
        loop {
            if let Some(found) = self.scoped.get(&(dir.to_path_buf(), name.to_string())) {
                return Some(*found);
            }
            if dir == project_root {
                break;
            }
            match dir.parent() {
                Some(parent) if parent.starts_with(project_root) || parent == project_root => {
                    dir = parent;
                }
                _ => break,
            }
        }
        None
    }

    pub fn resolve_hash(&self, hex: &str) -> Option<BlockRef> {
        self.global.get(hex).copied()
    }

    pub fn iter_entities(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.entities.iter().copied()
    }

    pub fn iter_models(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.models.iter().copied()
    }
}

/// Registers every model and entity block discovered by the scanner into
/// `table`, recording a `E0241` diagnostic for each duplicate. Called by the
/// linker (models, step 3/4) but kept here since it is pure symbol-table
/// bookkeeping.
pub fn register_all(
    store: &DocumentStore,
    table: &mut SymbolTable,
    diagnostics: &mut DiagnosticReport,
) {
    for (path_id, path) in (0..).zip(store.paths.iter()) {
        let Some(document) = store.get(path_id) else {
            continue;
        };
        let scope_dir = path.parent().unwrap_or(path).to_path_buf();
        for (index, model) in document.models.iter().enumerate() {
            let block_ref = BlockRef::Model { path_id, index };
            if table
                .register(&model.name, scope_dir.clone(), None, block_ref)
                .is_err()
            {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0241,
                        format!("duplicate id '{}' in scope {}", model.name, scope_dir.display()),
                    )
                    .with_location(model.location.clone()),
                );
            }
        }
        for (index, entity) in document.entities.iter().enumerate() {
            let block_ref = BlockRef::Entity { path_id, index };
            if table
                .register(
                    &entity.id,
                    scope_dir.clone(),
                    entity.content_hash.clone(),
                    block_ref,
                )
                .is_err()
            {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0241,
                        format!("duplicate id '{}' in scope {}", entity.id, scope_dir.display()),
                    )
                    .with_location(entity.location.clone()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_under_key_reorder() {
        let a = serde_json::json!({"name": "Alice", "email": "a@x"});
        let b = serde_json::json!({"email": "a@x", "name": "Alice"});
        assert_eq!(
            compute_content_hash("alice", "User", &a),
            compute_content_hash("alice", "User", &b)
        );
    }

    #[test]
    fn content_hash_changes_with_data() {
        let a = serde_json::json!({"name": "Alice"});
        let b = serde_json::json!({"name": "Bob"});
        assert_ne!(
            compute_content_hash("alice", "User", &a),
            compute_content_hash("alice", "User", &b)
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut table = SymbolTable::new();
        let scope = PathBuf::from("/project/entities");
        let r1 = BlockRef::Entity { path_id: 0, index: 0 };
        let r2 = BlockRef::Entity { path_id: 0, index: 1 };
        assert!(table.register("alice", scope.clone(), None, r1).is_ok());
        assert!(table.register("alice", scope, None, r2).is_err());
    }

    #[test]
    fn resolve_id_walks_up_to_project_root() {
        let mut table = SymbolTable::new();
        let root = PathBuf::from("/project");
        let nested = PathBuf::from("/project/entities/deep");
        let r = BlockRef::Entity { path_id: 0, index: 0 };
        table.register("shared", root.clone(), None, r).unwrap();

        let context = PathBuf::from("/project/entities/deep/file.td");
        let found = table.resolve_id("shared", &context, &root);
        assert_eq!(found, Some(r));
        let _ = nested;
    }
}
