//! The data model: documents, blocks, references, and front-matter.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::SchemaHandle;

/// A source span. `col_end` may be approximate but `line_start` must be
/// exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file_path: PathBuf,
    pub line_start: usize,
    pub line_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl SourceLocation {
    pub fn new(file_path: PathBuf, line_start: usize, line_end: usize) -> Self {
        SourceLocation {
            file_path,
            line_start,
            line_end,
            col_start: 0,
            col_end: 0,
        }
    }

    pub fn with_columns(mut self, col_start: usize, col_end: usize) -> Self {
        self.col_start = col_start;
        self.col_end = col_end;
        self
    }
}

/// A parsed occurrence of `[[target]]`, in prose or inside an entity's YAML
/// body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub target: String,
    pub location: SourceLocation,
}

/// Front-matter keys recognised at document scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontMatter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

/// A fenced-code-block variant. Every variant carries an optional id, a
/// source location, and the raw text of the block body.
#[derive(Debug, Clone)]
pub enum Block {
    Model(ModelBlock),
    Entity(EntityBlock),
    Spec(SpecBlock),
    Config(ConfigBlock),
}

impl Block {
    pub fn id(&self) -> Option<&str> {
        match self {
            Block::Model(b) => Some(&b.name),
            Block::Entity(b) => Some(&b.id),
            Block::Spec(b) => b.id.as_deref(),
            Block::Config(_) => None,
        }
    }

    pub fn location(&self) -> &SourceLocation {
        match self {
            Block::Model(b) => &b.location,
            Block::Entity(b) => &b.location,
            Block::Spec(b) => &b.location,
            Block::Config(b) => &b.location,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityBlock> {
        match self {
            Block::Entity(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_entity_mut(&mut self) -> Option<&mut EntityBlock> {
        match self {
            Block::Entity(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&ModelBlock> {
        match self {
            Block::Model(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_spec(&self) -> Option<&SpecBlock> {
        match self {
            Block::Spec(b) => Some(b),
            _ => None,
        }
    }
}

/// `model:<ClassName>` — a schema declaration, resolved after linking into a
/// [`SchemaHandle`].
#[derive(Debug, Clone)]
pub struct ModelBlock {
    pub name: String,
    pub body: String,
    pub location: SourceLocation,
    pub schema: Option<SchemaHandle>,
}

/// `entity <ClassName>: <entity-id>` — a data instance bound to a model.
#[derive(Debug, Clone)]
pub struct EntityBlock {
    pub class_name: String,
    pub id: String,
    pub raw_data: Value,
    pub resolved_data: Option<Value>,
    pub instantiated: Option<Value>,
    pub location: SourceLocation,
    pub content_hash: Option<String>,
    pub references: Vec<Reference>,
}

impl EntityBlock {
    /// The payload downstream consumers should read: `resolved_data` if the
    /// validator has populated it, else the raw, unresolved `raw_data`.
    pub fn effective_data(&self) -> &Value {
        self.resolved_data.as_ref().unwrap_or(&self.raw_data)
    }
}

/// `spec:<spec-id>` or `spec` — a cross-entity rule with an optional target
/// selector.
#[derive(Debug, Clone)]
pub struct SpecBlock {
    pub id: Option<String>,
    pub body: String,
    pub location: SourceLocation,
    pub selector: Option<SpecSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecScope {
    Local,
    Global,
}

#[derive(Debug, Clone)]
pub struct SpecSelector {
    pub kind: String,
    pub scope: SpecScope,
}

/// `config` / `config python` — only legal in `config.td`; contributes
/// bindings to the linker's name environment.
#[derive(Debug, Clone)]
pub struct ConfigBlock {
    pub body: String,
    pub location: SourceLocation,
}

/// One source file: its path, raw text, front-matter, and four owned block
/// lists.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub raw_text: String,
    pub front_matter: FrontMatter,
    pub models: Vec<ModelBlock>,
    pub entities: Vec<EntityBlock>,
    pub specs: Vec<SpecBlock>,
    pub configs: Vec<ConfigBlock>,
    /// Prose-level `[[...]]` references, not inside any block.
    pub prose_references: Vec<Reference>,
    /// True if the scanner hit a fatal parse failure (E0101) on this file;
    /// block lists are truncated at the point of failure.
    pub truncated: bool,
}

impl Document {
    pub fn new(path: PathBuf, raw_text: String) -> Self {
        Document {
            path,
            raw_text,
            front_matter: FrontMatter::default(),
            models: Vec::new(),
            entities: Vec::new(),
            specs: Vec::new(),
            configs: Vec::new(),
            prose_references: Vec::new(),
            truncated: false,
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.models
            .iter()
            .cloned()
            .map(Block::Model)
            .chain(self.entities.iter().cloned().map(Block::Entity))
            .chain(self.specs.iter().cloned().map(Block::Spec))
            .chain(self.configs.iter().cloned().map(Block::Config))
    }

    pub fn is_config_file(&self) -> bool {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == "config.td")
    }
}
