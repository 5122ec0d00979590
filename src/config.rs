//! Project configuration: `typedown.toml`, parsed with `toml` into a typed
//! struct (read-to-string, deserialize, default-fill via
//! `#[serde(default)]`), without a trait-object config-provider
//! indirection, since there is exactly one config source here and no
//! foreign-provider boundary to abstract over.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TypedownError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub members: Vec<String>,
}

/// A `scripts.<name>` compile preset: a named file filter for `check`/`run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptPreset {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkerConfig {
    #[serde(default)]
    pub prelude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub oracles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allowed_modules: Vec<String>,
    #[serde(default)]
    pub blocked_modules: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            allowed_modules: Vec::new(),
            blocked_modules: Vec::new(),
            enabled: true,
        }
    }
}

/// A `dependencies.<name>` table: exactly one of `path`, `url`, `git` names
/// the package source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySource {
    pub path: Option<String>,
    pub url: Option<String>,
    pub git: Option<String>,
}

/// The full `typedown.toml` shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypedownConfig {
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptPreset>,
    #[serde(default)]
    pub tasks: BTreeMap<String, String>,
    #[serde(default)]
    pub linker: LinkerConfig,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySource>,
}

impl TypedownConfig {
    /// Reads and parses `path` (usually `<root>/typedown.toml`). A missing
    /// file is not an error at this layer — callers that require a project
    /// root report `E0981` themselves, since "no config file" and "bad
    /// config file" are different failure shapes.
    pub fn load(path: &Path) -> Result<TypedownConfig, TypedownError> {
        tracing::debug!("reading project config from {:?}", path);
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(TypedownError::from)
    }
}

/// Walks upward from `start` looking for the nearest ancestor directory
/// containing `typedown.toml`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = if start.is_file() {
        start.parent()?
    } else {
        start
    };
    loop {
        if dir.join(crate::PROJECT_FILE).is_file() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_table_shape() {
        let toml_text = r#"
            [package]
            name = "demo"

            [scripts.ci]
            include = ["entities/**"]
            strict = true

            [tasks]
            lint = "typedown check"

            [linker]
            prelude = ["typedown.validators.email"]

            [dependencies.shared]
            path = "../shared"
        "#;
        let config: TypedownConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.package.name.as_deref(), Some("demo"));
        assert!(config.scripts["ci"].strict);
        assert_eq!(config.tasks["lint"], "typedown check");
        assert_eq!(config.linker.prelude, vec!["typedown.validators.email"]);
        assert_eq!(config.dependencies["shared"].path.as_deref(), Some("../shared"));
    }

    #[test]
    fn missing_tables_default_to_empty() {
        let config: TypedownConfig = toml::from_str("").unwrap();
        assert!(config.scripts.is_empty());
        assert!(config.security.enabled);
    }

    #[test]
    fn find_project_root_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("typedown.toml"), "").unwrap();
        let nested = root.join("entities/deep");
        fs::create_dir_all(&nested).unwrap();
        let found = find_project_root(&nested).unwrap();
        assert_eq!(found, root);
    }
}
