//! The Scanner (code range `E01xx`): walks the project, parses
//! each file's Markdown, and lifts fenced code blocks into the typed block
//! AST.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser as MdParser, Tag, TagEnd};
use regex::Regex;
use serde_json::Value;

use crate::diagnostic::{Diagnostic, DiagnosticReport, ErrorCode};
use crate::document::{
    ConfigBlock, Document, EntityBlock, FrontMatter, ModelBlock, Reference, SourceLocation,
    SpecBlock, SpecScope, SpecSelector,
};
use crate::source::SourceProvider;
use crate::symbol_table::compute_content_hash;

static REFERENCE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[(.*?)\]\]").unwrap());
static NESTED_LIST_ARTEFACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[\['([^']*)'\]\]\]").unwrap());
static FRONT_MATTER_DELIM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A---\r?\n(.*?)\r?\n---\r?\n?").unwrap());
static ENTITY_INFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^entity\s+(\S+)\s*:\s*(\S+)\s*$").unwrap());

static MODEL_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^model\b").unwrap());
static ENTITY_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^entity\b").unwrap());
static SPEC_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^spec\b").unwrap());
static CONFIG_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^config\b").unwrap());

/// The result of scanning: every parsed document plus the subset of paths
/// the caller explicitly asked about (as distinct from files pulled in only
/// because they share a project).
#[derive(Debug, Default)]
pub struct ScanResult {
    pub documents: BTreeMap<PathBuf, Document>,
    pub target_files: BTreeSet<PathBuf>,
}

/// Classification of a fenced block's info string, per the fixed grammar
/// recognised by `classify_info_string`.
enum BlockKind {
    Model { class_name: String },
    Entity { class_name: String, id: String },
    Spec { id: Option<String> },
    Config,
    /// Not one of the four recognised kinds — an ordinary code fence, not a
    /// Typedown block at all (e.g. ```rust).
    Unrecognized,
    /// Opens with one of the four reserved keywords (`model`, `entity`,
    /// `spec`, `config`) but doesn't match that keyword's grammar — e.g.
    /// `model User` (missing `:`) or `entity User alice` (missing `:`).
    /// Distinct from `Unrecognized` so a malformed Typedown block still
    /// gets a diagnostic instead of being silently treated as prose.
    Malformed { family: &'static str },
}

fn classify_info_string(info: &str) -> BlockKind {
    let info = info.trim();
    if let Some(rest) = info.strip_prefix("model:") {
        let class_name = rest.trim();
        if class_name.is_empty() {
            return BlockKind::Malformed { family: "model" };
        }
        return BlockKind::Model {
            class_name: class_name.to_string(),
        };
    }
    if info == "spec" {
        return BlockKind::Spec { id: None };
    }
    if let Some(rest) = info.strip_prefix("spec:") {
        let id = rest.trim();
        if id.is_empty() {
            return BlockKind::Malformed { family: "spec" };
        }
        return BlockKind::Spec {
            id: Some(id.to_string()),
        };
    }
    if info == "config" || info == "config python" {
        return BlockKind::Config;
    }
    if let Some(caps) = ENTITY_INFO.captures(info) {
        return BlockKind::Entity {
            class_name: caps[1].to_string(),
            id: caps[2].to_string(),
        };
    }
    if MODEL_PREFIX.is_match(info) {
        return BlockKind::Malformed { family: "model" };
    }
    if ENTITY_PREFIX.is_match(info) {
        return BlockKind::Malformed { family: "entity" };
    }
    if SPEC_PREFIX.is_match(info) {
        return BlockKind::Malformed { family: "spec" };
    }
    if CONFIG_PREFIX.is_match(info) {
        return BlockKind::Malformed { family: "config" };
    }
    BlockKind::Unrecognized
}

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options
}

/// 1-indexed line number of a byte offset within `text`.
fn line_of_offset(text: &str, offset: usize) -> usize {
    1 + text.as_bytes()[..offset.min(text.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
}

/// Rewrites the nested-list YAML artefact: the pattern
/// `[[['x']]]`, which a naive flow-YAML reading would parse as a sequence
/// of sequences, is rewritten to the string `"[[x]]"` so it parses as a
/// plain reference. Returns the desugared text and whether a rewrite fired
/// (driving the `E0103` anti-pattern diagnostic).
fn desugar_nested_list_artefact(body: &str) -> (String, bool) {
    if NESTED_LIST_ARTEFACT.is_match(body) {
        let rewritten = NESTED_LIST_ARTEFACT
            .replace_all(body, |caps: &regex::Captures| {
                format!("\"[[{}]]\"", &caps[1])
            })
            .into_owned();
        (rewritten, true)
    } else {
        (body.to_string(), false)
    }
}

/// Walks `value` recursively, collecting `[[target]]` occurrences found in
/// string leaves, attaching `location` (the enclosing block's location —
/// the scanner does not track sub-field positions within YAML bodies).
fn collect_value_references(value: &Value, location: &SourceLocation, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => {
            for caps in REFERENCE_PATTERN.captures_iter(s) {
                out.push(Reference {
                    target: caps[1].to_string(),
                    location: location.clone(),
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_value_references(item, location, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_value_references(v, location, out);
            }
        }
        _ => {}
    }
}

fn collect_prose_references(text: &str, path: &Path) -> Vec<Reference> {
    REFERENCE_PATTERN
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            let line = line_of_offset(text, whole.start());
            Reference {
                target: caps[1].to_string(),
                location: SourceLocation::new(path.to_path_buf(), line, line),
            }
        })
        .collect()
}

/// Extracts the `---`-delimited front-matter block, if present, returning
/// the remaining body text and the parsed [`FrontMatter`] (defaulted on
/// parse failure rather than treated as fatal — front-matter is metadata,
/// not structure).
fn extract_front_matter(text: &str) -> (String, FrontMatter) {
    match FRONT_MATTER_DELIM.captures(text) {
        Some(caps) => {
            let whole = caps.get(0).unwrap();
            let yaml = &caps[1];
            let front_matter = serde_yaml::from_str(yaml).unwrap_or_default();
            (text[whole.end()..].to_string(), front_matter)
        }
        None => (text.to_string(), FrontMatter::default()),
    }
}

/// Scans a single already-read file's content into a [`Document`],
/// appending diagnostics. `body_offset` is the byte length of any
/// front-matter block stripped before Markdown parsing, used to translate
/// event ranges (computed against the stripped body) back to line numbers
/// in the original text.
fn scan_document(path: &Path, raw_text: &str, diagnostics: &mut DiagnosticReport) -> Document {
    let mut document = Document::new(path.to_path_buf(), raw_text.to_string());
    let (body, front_matter) = extract_front_matter(raw_text);
    let body_offset = raw_text.len() - body.len();
    document.front_matter = front_matter;
    document.prose_references = collect_prose_references(raw_text, path);

    let parser = MdParser::new_ext(&body, markdown_options());
    let mut current_fence: Option<(String, usize)> = None;
    let mut text_buf = String::new();

    for (event, range) in parser.into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                current_fence = Some((info.to_string(), range.start + body_offset));
                text_buf.clear();
            }
            Event::Text(text) if current_fence.is_some() => {
                text_buf.push_str(&text);
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((info, start_offset)) = current_fence.take() {
                    let end_offset = range.end + body_offset;
                    let line_start = line_of_offset(raw_text, start_offset);
                    let line_end = line_of_offset(raw_text, end_offset.saturating_sub(1).max(start_offset));
                    let location = SourceLocation::new(path.to_path_buf(), line_start, line_end);
                    handle_fenced_block(&mut document, &info, &text_buf, location, diagnostics);
                    if document.truncated {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    document
}

fn handle_fenced_block(
    document: &mut Document,
    info: &str,
    body: &str,
    location: SourceLocation,
    diagnostics: &mut DiagnosticReport,
) {
    match classify_info_string(info) {
        BlockKind::Model { class_name } => {
            document.models.push(ModelBlock {
                name: class_name,
                body: body.to_string(),
                location,
                schema: None,
            });
        }
        BlockKind::Entity { class_name, id } => {
            let (desugared, had_artefact) = desugar_nested_list_artefact(body);
            if had_artefact {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0103,
                        format!("nested-list reference anti-pattern in entity '{id}'"),
                    )
                    .with_location(location.clone()),
                );
            }
            let raw_data: Value = match serde_yaml::from_str(&desugared) {
                Ok(value) => value,
                Err(err) => {
                    diagnostics.push(
                        Diagnostic::new(
                            ErrorCode::E0101,
                            format!("entity '{id}' body failed to parse as YAML: {err}"),
                        )
                        .with_location(location),
                    );
                    document.truncated = true;
                    return;
                }
            };
            let mut references = Vec::new();
            collect_value_references(&raw_data, &location, &mut references);
            let content_hash = compute_content_hash(&id, &class_name, &raw_data);
            document.entities.push(EntityBlock {
                class_name,
                id,
                raw_data,
                resolved_data: None,
                instantiated: None,
                location,
                content_hash: Some(content_hash),
                references,
            });
        }
        BlockKind::Spec { id } => {
            document.specs.push(SpecBlock {
                id,
                body: body.to_string(),
                location,
                selector: parse_spec_selector(body),
            });
        }
        BlockKind::Config => {
            if !document.is_config_file() {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0102,
                        format!(
                            "config block found outside config.td: {}",
                            location.file_path.display()
                        ),
                    )
                    .with_location(location.clone()),
                );
            }
            document.configs.push(ConfigBlock {
                body: body.to_string(),
                location,
            });
        }
        BlockKind::Unrecognized => {}
        BlockKind::Malformed { family } => {
            diagnostics.push(
                Diagnostic::new(
                    ErrorCode::E0105,
                    format!("malformed '{family}' block info string: '{info}'"),
                )
                .with_location(location),
            );
        }
    }
}

/// Looks for a leading `@target(kind, scope)` directive in a spec body; a
/// spec with no directive has no selector (runs once, ungrouped).
fn parse_spec_selector(body: &str) -> Option<SpecSelector> {
    let line = body.lines().find(|l| l.trim_start().starts_with("@target"))?;
    let inner = line.trim_start().strip_prefix("@target(")?.strip_suffix(')')?;
    let mut parts = inner.split(',').map(|p| p.trim().trim_matches('"'));
    let kind = parts.next()?.to_string();
    let scope = match parts.next()?.trim() {
        "global" => SpecScope::Global,
        _ => SpecScope::Local,
    };
    Some(SpecSelector { kind, scope })
}

/// Enumerates candidate source files under `root`, honoring `.gitignore`
/// semantics via `ignore::WalkBuilder` and restricting to the two
/// recognised extensions.
pub fn discover_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = ignore::WalkBuilder::new(root).hidden(false).build();
    for entry in walker.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if crate::SOURCE_EXTENSIONS.contains(&ext) {
                    files.push(path.to_path_buf());
                }
            }
        }
    }
    files.sort();
    files
}

/// Scans either a single file or a whole project tree rooted at `target`.
/// `target_files` records exactly the files the caller named (or, for a
/// directory target, every discovered file), distinguishing them from
/// files pulled in transitively by future incremental scans.
pub fn scan(
    source: &SourceProvider,
    target: &Path,
    diagnostics: &mut DiagnosticReport,
) -> ScanResult {
    let mut files: BTreeSet<PathBuf> = if target.is_dir() {
        discover_files(target).into_iter().collect()
    } else if target.is_file() {
        std::iter::once(target.to_path_buf()).collect()
    } else {
        BTreeSet::new()
    };

    // Overlay-only entries (a virtual `loadProject` workspace, or an
    // unsaved buffer at a path the real filesystem doesn't have) never
    // show up in a directory walk, so fold in whatever the source
    // provider is shadowing under `target` as well.
    for path in source.overlay_paths() {
        if !path.starts_with(target) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()).is_some_and(|ext| crate::SOURCE_EXTENSIONS.contains(&ext)) {
            files.insert(path);
        }
    }

    let mut result = ScanResult::default();
    for path in files {
        result.target_files.insert(path.clone());
        match source.get_content(&path) {
            Ok(text) => {
                let document = scan_document(&path, &text, diagnostics);
                result.documents.insert(path, document);
            }
            Err(_) => {
                diagnostics.push(Diagnostic::new(
                    ErrorCode::E0104,
                    format!("could not open file: {}", path.display()),
                ));
            }
        }
    }
    result
}

/// Re-validates the shallow, scanner-level properties of already-parsed
/// documents (config-in-wrong-file, nested-list artefacts) without running
/// the linker. Backs the `check syntax` CLI stage.
pub fn lint(documents: &BTreeMap<PathBuf, Document>) -> DiagnosticReport {
    let mut diagnostics = DiagnosticReport::new();
    for document in documents.values() {
        if !document.is_config_file() {
            for config in &document.configs {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0102,
                        format!(
                            "config block found outside config.td: {}",
                            document.path.display()
                        ),
                    )
                    .with_location(config.location.clone()),
                );
            }
        }
    }
    diagnostics
}
