//! The diagnostic engine: a fixed code taxonomy, an append-only report,
//! and the wire form consumed by the CLI and the language server.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::SourceLocation;

/// Severity of a [`Diagnostic`]. Only `Error` blocks the next pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Hint,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Hint => "hint",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A stage of the pipeline, derivable from a diagnostic code's second digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Scanner,
    Linker,
    Validator,
    Spec,
    System,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Scanner => "L1-Scanner",
            Stage::Linker => "L2-Linker",
            Stage::Validator => "L3-Validator",
            Stage::Spec => "L4-Spec",
            Stage::System => "System",
        };
        write!(f, "{s}")
    }
}

/// The fixed error code catalogue. Every variant's numeric value is its
/// `E0xxx` code; `stage()`/`category()` are derived from the digits rather
/// than hand-maintained per variant, matching the single-source-of-truth
/// template table the compiler this is grounded on uses for the same
/// purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    E0101,
    E0102,
    E0103,
    E0104,
    E0105,
    E0221,
    E0222,
    E0223,
    E0224,
    E0231,
    E0232,
    E0233,
    E0241,
    E0341,
    E0342,
    E0343,
    E0361,
    E0362,
    E0363,
    E0364,
    E0365,
    E0421,
    E0423,
    E0424,
    E0981,
    E0982,
    E0983,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::E0101 => "E0101",
            ErrorCode::E0102 => "E0102",
            ErrorCode::E0103 => "E0103",
            ErrorCode::E0104 => "E0104",
            ErrorCode::E0105 => "E0105",
            ErrorCode::E0221 => "E0221",
            ErrorCode::E0222 => "E0222",
            ErrorCode::E0223 => "E0223",
            ErrorCode::E0224 => "E0224",
            ErrorCode::E0231 => "E0231",
            ErrorCode::E0232 => "E0232",
            ErrorCode::E0233 => "E0233",
            ErrorCode::E0241 => "E0241",
            ErrorCode::E0341 => "E0341",
            ErrorCode::E0342 => "E0342",
            ErrorCode::E0343 => "E0343",
            ErrorCode::E0361 => "E0361",
            ErrorCode::E0362 => "E0362",
            ErrorCode::E0363 => "E0363",
            ErrorCode::E0364 => "E0364",
            ErrorCode::E0365 => "E0365",
            ErrorCode::E0421 => "E0421",
            ErrorCode::E0423 => "E0423",
            ErrorCode::E0424 => "E0424",
            ErrorCode::E0981 => "E0981",
            ErrorCode::E0982 => "E0982",
            ErrorCode::E0983 => "E0983",
        }
    }

    /// The digits of the code, as `(stage_digit, category_digit, seq)`.
    fn digits(&self) -> (u8, u8, u8) {
        let s = self.as_str();
        let bytes = s.as_bytes();
        // "E0SCC" where S = stage digit, CC = category/seq pair (two digits).
        let stage = bytes[2] - b'0';
        let category = bytes[3] - b'0';
        let seq = bytes[4] - b'0';
        (stage, category, seq)
    }

    pub fn stage(&self) -> Stage {
        match self.digits().0 {
            1 => Stage::Scanner,
            2 => Stage::Linker,
            3 => Stage::Validator,
            4 => Stage::Spec,
            9 => Stage::System,
            _ => Stage::System,
        }
    }

    pub fn category(&self) -> &'static str {
        match (self.digits().0, self.digits().1) {
            (1, 0) => "Syntax/Structure",
            (2, 2) => "Execution",
            (2, 3) => "Model",
            (2, 4) => "Symbol",
            (3, 4) => "Reference",
            (3, 6) => "Schema/Type",
            (4, 2) => "Execution/Assertion",
            (9, 8) => "Internal",
            _ => "Other",
        }
    }

    /// The default severity for a code, used when a call site does not pick
    /// one explicitly (warnings are the exception: E0223, E0224, E0423).
    pub fn default_level(&self) -> Level {
        matches!(self, ErrorCode::E0223 | ErrorCode::E0224 | ErrorCode::E0423)
            .then_some(Level::Warning)
            .unwrap_or(Level::Error)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single diagnostic, carrying enough context to render on the CLI, in
/// `--json` mode, and as an LSP publish-diagnostics entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub level: Level,
    pub message: String,
    pub location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Diagnostic {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Diagnostic {
            level: code.default_level(),
            code,
            message: message.into(),
            location: None,
            details: Value::Null,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn stage(&self) -> Stage {
        self.code.stage()
    }

    pub fn category(&self) -> &'static str {
        self.code.category()
    }

    /// The fixed wire shape: `{code, level, stage, category, message,
    /// location, details}`.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "level": self.level,
            "stage": self.stage().to_string(),
            "category": self.category(),
            "message": self.message,
            "location": self.location,
            "details": self.details,
        })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(
                f,
                "[{}] {} at {}:{}: {}",
                self.code, self.level, loc.file_path.display(), loc.line_start, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.code, self.level, self.message),
        }
    }
}

/// An ordered, append-only collection of diagnostics produced by one
/// compile. Rebuilt from scratch on every `compile()` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticReport {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(other);
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == Level::Error)
    }

    pub fn by_level(&self, level: Level) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.level == level).collect()
    }

    pub fn by_code(&self, code: ErrorCode) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.code == code).collect()
    }

    pub fn by_stage(&self, stage: Stage) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.stage() == stage)
            .collect()
    }

    /// Diagnostics scoped to a single file, for LSP per-document publishing.
    pub fn for_file(&self, path: &std::path::Path) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.location.as_ref().is_some_and(|l| l.file_path == path))
            .collect()
    }

    pub fn to_wire(&self) -> Value {
        Value::Array(self.diagnostics.iter().map(Diagnostic::to_wire).collect())
    }
}

impl<'a> IntoIterator for &'a DiagnosticReport {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_digits_derive_stage_and_category() {
        assert_eq!(ErrorCode::E0362.stage(), Stage::Validator);
        assert_eq!(ErrorCode::E0362.category(), "Schema/Type");
        assert_eq!(ErrorCode::E0221.stage(), Stage::Linker);
        assert_eq!(ErrorCode::E0424.stage(), Stage::Spec);
        assert_eq!(ErrorCode::E0981.stage(), Stage::System);
    }

    #[test]
    fn warnings_default_to_warning_level() {
        assert_eq!(ErrorCode::E0223.default_level(), Level::Warning);
        assert_eq!(ErrorCode::E0224.default_level(), Level::Warning);
        assert_eq!(ErrorCode::E0423.default_level(), Level::Warning);
        assert_eq!(ErrorCode::E0342.default_level(), Level::Error);
    }

    #[test]
    fn report_is_append_only_and_filterable() {
        let mut report = DiagnosticReport::new();
        report.push(Diagnostic::new(ErrorCode::E0241, "duplicate id 'alice'"));
        report.push(Diagnostic::new(ErrorCode::E0362, "type mismatch").with_level(Level::Error));
        assert_eq!(report.len(), 2);
        assert!(report.has_errors());
        assert_eq!(report.by_code(ErrorCode::E0241).len(), 1);
        assert_eq!(report.by_stage(Stage::Validator).len(), 1);
    }

    #[test]
    fn wire_form_round_trips_through_json() {
        let diag = Diagnostic::new(ErrorCode::E0362, "type mismatch")
            .with_details(serde_json::json!({"expected": "User", "actual": "Product"}));
        let wire = diag.to_wire();
        assert_eq!(wire["code"], "E0362");
        assert_eq!(wire["stage"], "L3-Validator");
        assert_eq!(wire["details"]["expected"], "User");
    }
}
