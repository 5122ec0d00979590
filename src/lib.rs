//! Typedown compiles a hybrid Markdown dialect in which fenced code blocks
//! declare typed data: schema definitions (models), instances (entities),
//! cross-entity rules (specs), and contextual code (configs). A project is a
//! tree of `.md`/`.td` files rooted at the nearest ancestor directory holding
//! a `typedown.toml`.
//!
//! # Pipeline
//!
//! Compilation runs through four stages over shared state owned by a single
//! [`project::Compiler`]:
//!
//! 1. [`scanner`] walks the project through the [`source`] provider and lifts
//!    each file into a typed block AST ([`document`]) with source locations.
//! 2. [`linker`] executes config and model blocks against the declarative
//!    schema grammar in [`schema`], builds the [`symbol_table`], and assigns
//!    models to entities.
//! 3. [`validator`] runs four sub-stages (schema, local, global, specs),
//!    building the [`graph`] of `former`-edges and resolving `[[id]]`
//!    references through the [`query`] engine.
//! 4. The query engine is also exposed directly, for ad-hoc lookups from the
//!    CLI and the language server.
//!
//! Every stage writes to a single [`diagnostic::DiagnosticReport`], whose
//! codes follow the fixed taxonomy in [`diagnostic::ErrorCode`].
//!
//! The `lsp` and `watch` features add a language-server transport and a
//! filesystem-watch-driven recompile loop on top of the same core; neither
//! changes the pipeline's semantics.

pub mod config;
pub mod diagnostic;
pub mod document;
pub mod error;
pub mod graph;
pub mod identifier;
pub mod linker;
pub mod project;
pub mod query;
pub mod scanner;
pub mod schema;
pub mod source;
pub mod spec_runner;
pub mod symbol_table;
pub mod validator;

#[cfg(feature = "lsp")]
pub mod lsp;

#[cfg(feature = "watch")]
pub mod watch;

pub use config::TypedownConfig;
pub use diagnostic::{Diagnostic, DiagnosticReport, ErrorCode, Level};
pub use document::{Block, Document, SourceLocation};
pub use error::TypedownError;
pub use identifier::Identifier;
pub use project::{CompileOptions, Compiler, Project, Stage};

/// The two recognised source file extensions.
pub const SOURCE_EXTENSIONS: [&str; 2] = ["md", "td"];

/// The project marker file that fixes a project's root directory.
pub const PROJECT_FILE: &str = "typedown.toml";
