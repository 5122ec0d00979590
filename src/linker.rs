//! The Linker (code range `E02xx`): executes the config cascade to build a
//! name environment, parses model bodies into schemas, and registers every
//! model and entity into the symbol table. A model body may reference a
//! cascaded config binding with `${name}` in place of a literal default;
//! since that substitution happens after the whole cascade has resolved, it
//! can pull in a value pinned down by a scope the model text itself never
//! saw — a late-bound schema rebuild, flagged as `E0224`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::diagnostic::{Diagnostic, DiagnosticReport, ErrorCode, Level};
use crate::schema::{parse_schema, Schema, SchemaHandle};
use crate::symbol_table::{register_all, BlockRef, DocumentStore, Resolved, SymbolTable};

/// A value bound by a config block: the cascade only needs enough shape to
/// thread simple settings between directories, via an explicit name
/// environment rather than process globals.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Number(f64),
    Bool(bool),
    List(Vec<ConfigValue>),
}

/// A flattened set of name bindings for one directory depth, threaded
/// explicitly through the cascade rather than stored in a process global.
#[derive(Debug, Clone, Default)]
pub struct NameEnvironment {
    bindings: BTreeMap<String, ConfigValue>,
}

impl NameEnvironment {
    pub fn get(&self, name: &str) -> Option<&ConfigValue> {
        self.bindings.get(name)
    }

    fn extended(&self, extra: impl IntoIterator<Item = (String, ConfigValue)>) -> Self {
        let mut bindings = self.bindings.clone();
        bindings.extend(extra);
        NameEnvironment { bindings }
    }
}

/// Parses one config block's body into `name = value` bindings. The
/// grammar is deliberately tiny: comments (`# ...`), blank lines, and
/// `name = <string|number|bool|[list]>` assignments — enough to carry
/// cascading settings without an executable surface.
fn parse_config_bindings(body: &str) -> Result<Vec<(String, ConfigValue)>, String> {
    let mut bindings = Vec::new();
    for (lineno, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value_str) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected 'name = value'", lineno + 1))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(format!("line {}: invalid binding name '{name}'", lineno + 1));
        }
        let value = parse_config_value(value_str.trim())
            .ok_or_else(|| format!("line {}: invalid value '{value_str}'", lineno + 1))?;
        bindings.push((name.to_string(), value));
    }
    Ok(bindings)
}

fn parse_config_value(text: &str) -> Option<ConfigValue> {
    if let Some(inner) = text.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Some(ConfigValue::Str(inner.to_string()));
    }
    if text == "true" {
        return Some(ConfigValue::Bool(true));
    }
    if text == "false" {
        return Some(ConfigValue::Bool(false));
    }
    if let Ok(n) = text.parse::<f64>() {
        return Some(ConfigValue::Number(n));
    }
    if let Some(inner) = text.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if inner.trim().is_empty() {
            return Some(ConfigValue::List(Vec::new()));
        }
        let items: Option<Vec<ConfigValue>> =
            inner.split(',').map(|item| parse_config_value(item.trim())).collect();
        return items.map(ConfigValue::List);
    }
    None
}

fn depth(path: &Path, root: &Path) -> usize {
    path.strip_prefix(root)
        .map(|rel| rel.components().count())
        .unwrap_or(0)
}

/// Output of [`link`]: the populated symbol table plus, per entity
/// `BlockRef`, the schema the linker could resolve for it (`None` means the
/// class name did not resolve — the validator reports `E0364`).
pub struct LinkResult {
    pub table: SymbolTable,
    pub model_assignment: BTreeMap<BlockRef, Option<SchemaHandle>>,
}

/// Runs the full linker algorithm in strict order: prelude, config cascade,
/// models, entity registration, model assignment.
pub fn link(
    project_root: &Path,
    store: &mut DocumentStore,
    prelude: &[String],
    diagnostics: &mut DiagnosticReport,
) -> LinkResult {
    let base_env = load_prelude(prelude, diagnostics);
    let scope_envs = run_config_cascade(project_root, store, base_env.clone(), diagnostics);
    run_models(store, &scope_envs, project_root, &base_env, diagnostics);

    let mut table = SymbolTable::new();
    register_all(store, &mut table, diagnostics);

    let model_assignment = assign_models(store, &table, project_root);

    LinkResult {
        table,
        model_assignment,
    }
}

/// Step 1: prelude names are loaded into the base environment; a malformed
/// name is a warning (`E0223`), not fatal.
fn load_prelude(prelude: &[String], diagnostics: &mut DiagnosticReport) -> NameEnvironment {
    let mut bindings = Vec::new();
    for name in prelude {
        let trimmed = name.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_') {
            diagnostics.push(
                Diagnostic::new(ErrorCode::E0223, format!("invalid prelude name '{name}'"))
                    .with_level(Level::Warning),
            );
            continue;
        }
        bindings.push((trimmed.to_string(), ConfigValue::Bool(true)));
    }
    NameEnvironment::default().extended(bindings)
}

/// Step 2: config cascade, sorted `(depth(path), path_string)` ascending so
/// shallower configs execute before deeper ones; each deeper scope's
/// environment is the ancestor's extended with its own bindings.
fn run_config_cascade(
    project_root: &Path,
    store: &DocumentStore,
    base_env: NameEnvironment,
    diagnostics: &mut DiagnosticReport,
) -> BTreeMap<PathBuf, NameEnvironment> {
    let mut blocks: Vec<(PathBuf, usize, &crate::document::ConfigBlock)> = Vec::new();
    for document in store.documents() {
        let dir = document.path.parent().unwrap_or(&document.path).to_path_buf();
        for config in &document.configs {
            blocks.push((dir.clone(), depth(&dir, project_root), config));
        }
    }
    blocks.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut scope_envs: BTreeMap<PathBuf, NameEnvironment> = BTreeMap::new();
    for (dir, _depth, config) in blocks {
        let ancestor_env = nearest_ancestor_env(&dir, project_root, &scope_envs, &base_env);
        match parse_config_bindings(&config.body) {
            Ok(bindings) => {
                let env = ancestor_env.extended(bindings);
                scope_envs.insert(dir, env);
            }
            Err(message) => {
                diagnostics.push(
                    Diagnostic::new(ErrorCode::E0222, format!("config execution failed: {message}"))
                        .with_location(config.location.clone()),
                );
                scope_envs.entry(dir).or_insert(ancestor_env);
            }
        }
    }
    scope_envs
}

fn nearest_ancestor_env(
    dir: &Path,
    project_root: &Path,
    scope_envs: &BTreeMap<PathBuf, NameEnvironment>,
    base_env: &NameEnvironment,
) -> NameEnvironment {
    let mut current = dir.parent();
    while let Some(candidate) = current {
        if let Some(env) = scope_envs.get(candidate) {
            return env.clone();
        }
        if candidate == project_root {
            break;
        }
        current = candidate.parent();
    }
    base_env.clone()
}

/// A model body may reference a config-cascade binding with `${name}`
/// instead of a literal default, e.g. `role: str = ${default_role}`. The
/// cascade (step 2) has already fully resolved by the time this runs, so the
/// substitution always succeeds against the environment in scope at the
/// model's own directory — but the value plugged in can be pinned down by a
/// config scope that wasn't in effect, or didn't exist yet, wherever the
/// model text itself was authored. Returns the substituted body and whether
/// any placeholder fired.
fn substitute_late_bindings(body: &str, env: &NameEnvironment) -> (String, bool) {
    let mut result = String::with_capacity(body.len());
    let mut rest = body;
    let mut fired = false;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end_rel) => {
                let end = start + end_rel;
                let name = &rest[start + 2..end];
                match env.get(name) {
                    Some(value) => {
                        result.push_str(&render_config_value(value));
                        fired = true;
                    }
                    None => result.push_str(&rest[start..=end]),
                }
                rest = &rest[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    (result, fired)
}

fn render_config_value(value: &ConfigValue) -> String {
    match value {
        ConfigValue::Str(s) => format!("\"{s}\""),
        ConfigValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        ConfigValue::Number(n) => n.to_string(),
        ConfigValue::Bool(b) => b.to_string(),
        ConfigValue::List(items) => {
            let rendered: Vec<String> = items.iter().map(render_config_value).collect();
            format!("[{}]", rendered.join(", "))
        }
    }
}

/// The name environment effective at `dir`: its own config scope if one was
/// registered there, otherwise the nearest ancestor's (falling back to
/// `base_env`).
fn effective_env_for_dir(
    dir: &Path,
    project_root: &Path,
    scope_envs: &BTreeMap<PathBuf, NameEnvironment>,
    base_env: &NameEnvironment,
) -> NameEnvironment {
    match scope_envs.get(dir) {
        Some(env) => env.clone(),
        None => nearest_ancestor_env(dir, project_root, scope_envs, base_env),
    }
}

/// Step 3: parse each model body via the declarative schema grammar and
/// validate its shape. `${name}` placeholders are substituted from the
/// config cascade first, which can fire a late-binding rebuild warning
/// (`E0224`); see [`substitute_late_bindings`].
fn run_models(
    store: &mut DocumentStore,
    scope_envs: &BTreeMap<PathBuf, NameEnvironment>,
    project_root: &Path,
    base_env: &NameEnvironment,
    diagnostics: &mut DiagnosticReport,
) {
    for document in store.documents_mut() {
        let dir = document.path.parent().unwrap_or(&document.path).to_path_buf();
        let env = effective_env_for_dir(&dir, project_root, scope_envs, base_env);
        for model in document.models.iter_mut() {
            let (body, late_bound) = substitute_late_bindings(&model.body, &env);
            if late_bound {
                diagnostics.push(Diagnostic::new(
                    ErrorCode::E0224,
                    format!(
                        "model '{}' schema rebuilt against late-bound config value(s)",
                        model.name
                    ),
                ).with_location(model.location.clone()));
            }
            match parse_schema(&body) {
                Ok(schema) => {
                    if schema.name() != model.name {
                        diagnostics.push(
                            Diagnostic::new(
                                ErrorCode::E0231,
                                format!(
                                    "model signature declares '{}' but schema body declares '{}'",
                                    model.name,
                                    schema.name()
                                ),
                            )
                            .with_location(model.location.clone()),
                        );
                        continue;
                    }
                    if let Some(shape_error) = invalid_shape(&schema) {
                        diagnostics.push(
                            Diagnostic::new(ErrorCode::E0233, shape_error)
                                .with_location(model.location.clone()),
                        );
                        continue;
                    }
                    if let Schema::Record(record) = &schema {
                        if record.has_reserved_id_field() {
                            diagnostics.push(
                                Diagnostic::new(
                                    ErrorCode::E0232,
                                    format!("model '{}' declares a reserved field named 'id'", model.name),
                                )
                                .with_location(model.location.clone()),
                            );
                            continue;
                        }
                    }
                    model.schema = Some(SchemaHandle::new(schema));
                }
                Err(err) => {
                    diagnostics.push(
                        Diagnostic::new(
                            ErrorCode::E0221,
                            format!("model '{}' failed to parse: {err}", model.name),
                        )
                        .with_location(model.location.clone()),
                    );
                }
            }
        }
    }
}

fn invalid_shape(schema: &Schema) -> Option<String> {
    if let Schema::Record(record) = schema {
        let mut seen = std::collections::BTreeSet::new();
        for field in &record.fields {
            if !seen.insert(field.name.clone()) {
                return Some(format!(
                    "model '{}' declares field '{}' more than once",
                    record.name, field.name
                ));
            }
        }
        for (target, validator) in &record.field_validators {
            if record.field(target).is_none() {
                return Some(format!(
                    "model '{}' validates unknown field '{}'",
                    record.name, target
                ));
            }
            if !crate::schema::FIELD_VALIDATOR_NAMES.contains(&validator.name.as_str()) {
                return Some(format!(
                    "model '{}' uses unknown field validator '{}'",
                    record.name, validator.name
                ));
            }
        }
        for validator in &record.record_validators {
            if !crate::schema::RECORD_VALIDATOR_NAMES.contains(&validator.name.as_str()) {
                return Some(format!(
                    "model '{}' uses unknown record validator '{}'",
                    record.name, validator.name
                ));
            }
        }
    }
    if let Schema::Enum(e) = schema {
        if e.variants.is_empty() {
            return Some(format!("enum '{}' declares no variants", e.name));
        }
    }
    None
}

/// Step 5: resolve each entity's declared class name using the same
/// lexical rules as handle resolution, so a schema declared in a sibling
/// file shadows a project-wide one. Unresolved entries are left `None`;
/// the validator reports `E0364`.
fn assign_models(
    store: &DocumentStore,
    table: &SymbolTable,
    project_root: &Path,
) -> BTreeMap<BlockRef, Option<SchemaHandle>> {
    let mut assignment = BTreeMap::new();
    for block_ref in table.iter_entities() {
        let Some(Resolved::Entity(entity)) = store.resolve(block_ref) else {
            continue;
        };
        let resolved = table
            .resolve_id(&entity.class_name, &entity.location.file_path, project_root)
            .and_then(|model_ref| store.resolve(model_ref))
            .and_then(|resolved| match resolved {
                Resolved::Model(model) => model.schema.clone(),
                Resolved::Entity(_) => None,
            });
        assignment.insert(block_ref, resolved);
    }
    assignment
}

/// Reference-target resolution inside `[[...]]` strings is handled by the
/// query engine; the linker only needs to know whether a raw YAML value
/// looks reference-shaped, for stages that must suppress reference-shaped
/// structural failures.
pub fn looks_like_reference(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.starts_with("[[") && s.ends_with("]]"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, ModelBlock, SourceLocation};
    use std::path::PathBuf;

    #[test]
    fn prelude_warns_on_invalid_name_but_continues() {
        let mut diagnostics = DiagnosticReport::new();
        let env = load_prelude(&["valid.name".to_string(), "  ".to_string()], &mut diagnostics);
        assert!(env.get("valid.name").is_some());
        assert_eq!(diagnostics.by_code(ErrorCode::E0223).len(), 1);
    }

    #[test]
    fn config_cascade_threads_ancestor_bindings() {
        let mut store = DocumentStore::new();
        let root = PathBuf::from("/project");
        let mut root_doc = Document::new(root.join("config.td"), String::new());
        root_doc.configs.push(crate::document::ConfigBlock {
            body: "greeting = \"hi\"".to_string(),
            location: SourceLocation::new(root.join("config.td"), 1, 1),
        });
        store.insert(root_doc);

        let mut nested_doc = Document::new(root.join("sub/config.td"), String::new());
        nested_doc.configs.push(crate::document::ConfigBlock {
            body: "name = \"nested\"".to_string(),
            location: SourceLocation::new(root.join("sub/config.td"), 1, 1),
        });
        store.insert(nested_doc);

        let mut diagnostics = DiagnosticReport::new();
        let envs = run_config_cascade(&root, &store, NameEnvironment::default(), &mut diagnostics);
        let nested_env = envs.get(&root.join("sub")).unwrap();
        assert_eq!(nested_env.get("greeting"), Some(&ConfigValue::Str("hi".to_string())));
        assert_eq!(nested_env.get("name"), Some(&ConfigValue::Str("nested".to_string())));
    }

    #[test]
    fn model_name_mismatch_is_e0231() {
        let mut store = DocumentStore::new();
        let path = PathBuf::from("/project/models/user.td");
        let mut document = Document::new(path.clone(), String::new());
        document.models.push(ModelBlock {
            name: "User".to_string(),
            body: "record Other { name: str }".to_string(),
            location: SourceLocation::new(path, 1, 1),
            schema: None,
        });
        store.insert(document);

        let mut diagnostics = DiagnosticReport::new();
        run_models(&mut store, &BTreeMap::new(), Path::new("/project"), &NameEnvironment::default(), &mut diagnostics);
        assert_eq!(diagnostics.by_code(ErrorCode::E0231).len(), 1);
    }

    #[test]
    fn reserved_id_field_is_e0232() {
        let mut store = DocumentStore::new();
        let path = PathBuf::from("/project/models/user.td");
        let mut document = Document::new(path.clone(), String::new());
        document.models.push(ModelBlock {
            name: "User".to_string(),
            body: "record User { id: str, name: str }".to_string(),
            location: SourceLocation::new(path, 1, 1),
            schema: None,
        });
        store.insert(document);

        let mut diagnostics = DiagnosticReport::new();
        run_models(&mut store, &BTreeMap::new(), Path::new("/project"), &NameEnvironment::default(), &mut diagnostics);
        assert_eq!(diagnostics.by_code(ErrorCode::E0232).len(), 1);
    }

    #[test]
    fn substitute_late_bindings_fills_in_a_bound_name() {
        let env = NameEnvironment::default()
            .extended([("default_role".to_string(), ConfigValue::Str("guest".to_string()))]);
        let (body, fired) = substitute_late_bindings("role: str = ${default_role}", &env);
        assert!(fired);
        assert_eq!(body, "role: str = \"guest\"");
    }

    #[test]
    fn substitute_late_bindings_leaves_unbound_placeholder_untouched() {
        let env = NameEnvironment::default();
        let (body, fired) = substitute_late_bindings("role: str = ${default_role}", &env);
        assert!(!fired);
        assert_eq!(body, "role: str = ${default_role}");
    }

    #[test]
    fn e0224_fires_when_model_default_interpolates_a_cascaded_config_value() {
        let mut store = DocumentStore::new();
        let root = PathBuf::from("/project");
        let path = root.join("models/user.td");
        let mut document = Document::new(path.clone(), String::new());
        document.models.push(ModelBlock {
            name: "User".to_string(),
            body: "record User { name: str, role: str = ${default_role} }".to_string(),
            location: SourceLocation::new(path, 1, 1),
            schema: None,
        });
        store.insert(document);

        let mut scope_envs = BTreeMap::new();
        scope_envs.insert(
            root.join("models"),
            NameEnvironment::default()
                .extended([("default_role".to_string(), ConfigValue::Str("guest".to_string()))]),
        );

        let mut diagnostics = DiagnosticReport::new();
        run_models(&mut store, &scope_envs, &root, &NameEnvironment::default(), &mut diagnostics);

        let warnings = diagnostics.by_code(ErrorCode::E0224);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, Level::Warning);

        let schema = store
            .documents()
            .next()
            .unwrap()
            .models
            .first()
            .unwrap()
            .schema
            .as_ref()
            .expect("schema should still parse once the placeholder is substituted");
        assert_eq!(schema.name(), "User");
    }

    #[test]
    fn model_with_no_placeholder_never_fires_e0224() {
        let mut store = DocumentStore::new();
        let path = PathBuf::from("/project/models/user.td");
        let mut document = Document::new(path.clone(), String::new());
        document.models.push(ModelBlock {
            name: "User".to_string(),
            body: "record User { name: str }".to_string(),
            location: SourceLocation::new(path, 1, 1),
            schema: None,
        });
        store.insert(document);

        let mut diagnostics = DiagnosticReport::new();
        run_models(&mut store, &BTreeMap::new(), Path::new("/project"), &NameEnvironment::default(), &mut diagnostics);
        assert!(diagnostics.by_code(ErrorCode::E0224).is_empty());
    }
}
