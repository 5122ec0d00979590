use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diagnostic::ErrorCode;

/// System-level failures that abort a command before any diagnostics can be
/// collected: these are distinct from [`crate::diagnostic::Diagnostic`],
/// which describes a recoverable, per-block problem gathered into a
/// [`crate::diagnostic::DiagnosticReport`].
#[derive(Debug, Clone, Error)]
pub enum TypedownError {
    #[error("file system error: {0}")]
    Io(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("TOML error: {0}")]
    Toml(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("sandbox violation: {0}")]
    Sandbox(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dependency cycle: {0:?}")]
    Cycle(Vec<String>),

    #[error("invalid command: {0}")]
    Command(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TypedownError {
    /// Maps this error to a process exit code, mirroring the diagnostic
    /// engine's System (`E09xx`) category so CLI failures and compile
    /// diagnostics share one numbering scheme end to end.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TypedownError::Io(_) | TypedownError::Toml(_) => ErrorCode::E0981,
            TypedownError::Yaml(_) | TypedownError::Json(_) => ErrorCode::E0981,
            TypedownError::Schema(_) => ErrorCode::E0233,
            TypedownError::Query(_) => ErrorCode::E0365,
            TypedownError::Sandbox(_) => ErrorCode::E0983,
            TypedownError::NotFound(_) => ErrorCode::E0981,
            TypedownError::Cycle(_) => ErrorCode::E0342,
            TypedownError::Command(_) => ErrorCode::E0981,
            TypedownError::Internal(_) => ErrorCode::E0982,
        }
    }

    /// Exit code a CLI command should use when this error aborts it.
    pub fn exit_code(&self) -> i32 {
        match self {
            TypedownError::Command(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for TypedownError {
    fn from(e: std::io::Error) -> Self {
        TypedownError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for TypedownError {
    fn from(e: serde_yaml::Error) -> Self {
        TypedownError::Yaml(e.to_string())
    }
}

impl From<toml::de::Error> for TypedownError {
    fn from(e: toml::de::Error) -> Self {
        TypedownError::Toml(e.to_string())
    }
}

impl From<toml::ser::Error> for TypedownError {
    fn from(e: toml::ser::Error) -> Self {
        TypedownError::Toml(e.to_string())
    }
}

impl From<serde_json::Error> for TypedownError {
    fn from(e: serde_json::Error) -> Self {
        TypedownError::Json(e.to_string())
    }
}

/// Serialisable projection of [`TypedownError`], used when a system error
/// must cross the LSP wire or the CLI's `--json` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl From<&TypedownError> for ErrorEnvelope {
    fn from(e: &TypedownError) -> Self {
        ErrorEnvelope {
            code: e.error_code().as_str().to_string(),
            message: e.to_string(),
        }
    }
}
