//! Project lifecycle and compile orchestration: a `Project` is the
//! discovered root plus its config; a `Compiler` owns the long-lived
//! `SourceProvider` overlay and drives a full scan → link → validate
//! pipeline on each `compile()` call, rebuilding every other piece of
//! state from scratch.

use std::path::{Path, PathBuf};

use crate::config::{find_project_root, TypedownConfig};
use crate::diagnostic::{Diagnostic, DiagnosticReport, ErrorCode};
use crate::error::TypedownError;
use crate::linker;
use crate::scanner;
use crate::source::SourceProvider;
use crate::symbol_table::{DocumentStore, Resolved, SymbolTable};
use crate::validator::{self, ValidateStage};

/// The progressive validation stage a `compile()` call should stop after,
/// matching the CLI's `check [stage]` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Syntax,
    Structure,
    Local,
    Global,
}

impl Stage {
    fn validate_stage(self) -> Option<ValidateStage> {
        match self {
            Stage::Syntax => None,
            Stage::Structure => Some(ValidateStage::Schema),
            Stage::Local => Some(ValidateStage::Local),
            Stage::Global => Some(ValidateStage::Specs),
        }
    }
}

/// Options for one `compile()` call. `target` narrows the scan to a single
/// file or subdirectory (default: the whole project root).
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: Option<PathBuf>,
    pub stage: Stage,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            target: None,
            stage: Stage::Global,
        }
    }
}

/// The discovered project root and its parsed `typedown.toml`.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: TypedownConfig,
}

impl Project {
    /// Walks upward from `start` to find the nearest `typedown.toml` and
    /// loads it.
    pub fn discover(start: &Path) -> Result<Project, TypedownError> {
        let root = find_project_root(start).ok_or_else(|| {
            TypedownError::NotFound(format!(
                "no {} found above {}",
                crate::PROJECT_FILE,
                start.display()
            ))
        })?;
        let config = TypedownConfig::load(&root.join(crate::PROJECT_FILE))?;
        Ok(Project { root, config })
    }

    /// A project with an empty in-memory config, for tests and `init`.
    pub fn memory(root: impl Into<PathBuf>) -> Project {
        Project {
            root: root.into(),
            config: TypedownConfig::default(),
        }
    }
}

/// Everything a single `compile()` call produces: the rebuilt document
/// store and symbol table (kept alive so the caller can run ad-hoc
/// queries against the just-compiled state) plus the diagnostic report.
pub struct CompileResult {
    pub diagnostics: DiagnosticReport,
    pub store: DocumentStore,
    pub table: SymbolTable,
}

/// Owns the project descriptor and the long-lived `SourceProvider`
/// overlay. Everything else — symbol table, dependency graph, diagnostics —
/// is rebuilt from scratch on each `compile()`, so no cross-compile
/// mutation hazard exists.
pub struct Compiler {
    pub project: Project,
    pub source: SourceProvider,
}

impl Compiler {
    pub fn new(project: Project) -> Self {
        let source = SourceProvider::new(project.root.clone());
        Compiler { project, source }
    }

    /// A compiler over a purely in-memory project (LSP `loadProject`
    /// hydration, or tests).
    pub fn in_memory(project: Project) -> Self {
        Compiler {
            project,
            source: SourceProvider::memory_only(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.project.root
    }

    /// Runs the full pipeline up to `options.stage`, returning a fresh
    /// `CompileResult`. Stages after the first one to report an `error`-level
    /// diagnostic are skipped.
    pub fn compile(&self, options: &CompileOptions) -> CompileResult {
        let target = options
            .target
            .clone()
            .unwrap_or_else(|| self.project.root.clone());

        tracing::info!(target: "typedown::compile", stage = ?options.stage, path = %target.display(), "compile starting");

        let mut diagnostics = DiagnosticReport::new();
        let scan_result = scanner::scan(&self.source, &target, &mut diagnostics);

        let mut store = DocumentStore::new();
        for (_, document) in scan_result.documents {
            store.insert(document);
        }

        let Some(validate_stage) = options.stage.validate_stage() else {
            tracing::debug!("syntax-only compile, skipping linker and validator");
            return CompileResult {
                diagnostics,
                store,
                table: SymbolTable::new(),
            };
        };

        tracing::debug!("linking");
        let link_result = linker::link(
            &self.project.root,
            &mut store,
            &self.project.config.linker.prelude,
            &mut diagnostics,
        );

        for (block_ref, schema) in &link_result.model_assignment {
            if schema.is_some() {
                continue;
            }
            if let Some(Resolved::Entity(entity)) = store.resolve(*block_ref) {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0364,
                        format!(
                            "entity '{}' declares unresolved class '{}'",
                            entity.id, entity.class_name
                        ),
                    )
                    .with_location(entity.location.clone()),
                );
            }
        }

        tracing::debug!(?validate_stage, "validating");
        validator::validate(
            &self.project.root,
            &mut store,
            &link_result.table,
            &link_result.model_assignment,
            validate_stage,
            &mut diagnostics,
        );

        tracing::info!(
            target: "typedown::compile",
            errors = diagnostics.by_level(crate::diagnostic::Level::Error).len(),
            "compile finished"
        );

        CompileResult {
            diagnostics,
            store,
            table: link_result.table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn write_happy_path_project(dir: &Path) {
        std::fs::write(dir.join("typedown.toml"), "").unwrap();
        std::fs::create_dir_all(dir.join("models")).unwrap();
        std::fs::create_dir_all(dir.join("entities")).unwrap();
        std::fs::write(
            dir.join("models/user.td"),
            indoc! {"
                ```model:User
                record User { name: str, email: str }
                ```
            "},
        )
        .unwrap();
        std::fs::write(
            dir.join("entities/alice.td"),
            indoc! {"
                ```entity User: alice
                name: Alice
                email: a@x
                ```
            "},
        )
        .unwrap();
    }

    #[test]
    fn happy_path_project_compiles_without_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_happy_path_project(dir.path());

        let project = Project::discover(dir.path()).unwrap();
        let compiler = Compiler::new(project);
        let result = compiler.compile(&CompileOptions {
            target: None,
            stage: Stage::Global,
        });

        assert!(!result.diagnostics.has_errors(), "{:?}", result.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn syntax_stage_skips_linker_and_validator() {
        let dir = tempfile::tempdir().unwrap();
        write_happy_path_project(dir.path());
        let project = Project::discover(dir.path()).unwrap();
        let compiler = Compiler::new(project);
        let result = compiler.compile(&CompileOptions {
            target: None,
            stage: Stage::Syntax,
        });
        assert!(result.table.iter_entities().next().is_none());
    }

    #[test]
    fn unresolved_entity_class_reports_e0364() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("typedown.toml"), "").unwrap();
        std::fs::write(
            dir.path().join("orphan.td"),
            indoc! {"
                ```entity Ghost: g1
                name: nobody
                ```
            "},
        )
        .unwrap();
        let project = Project::discover(dir.path()).unwrap();
        let compiler = Compiler::new(project);
        let result = compiler.compile(&CompileOptions::default());
        assert_eq!(result.diagnostics.by_code(ErrorCode::E0364).len(), 1);
    }
}
