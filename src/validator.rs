//! The Validator (code range `E03xx`): four strictly ordered sub-stages —
//! schema, local, global, specs — each appending to a single diagnostic
//! accumulator threaded by `&mut`, as a fixed four-stage pipeline rather
//! than an open-ended reparse loop.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::diagnostic::{Diagnostic, DiagnosticReport, ErrorCode, Level};
use crate::document::SourceLocation;
use crate::graph::DependencyGraph;
use crate::identifier::{split_query, Identifier};
use crate::linker::looks_like_reference;
use crate::query::QueryEngine;
use crate::schema::{FieldType, RecordSchema, Schema, SchemaHandle, Validator};
use crate::symbol_table::{BlockRef, DocumentStore, Resolved, SymbolTable};

/// Which sub-stage a `check` invocation should stop after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidateStage {
    Schema,
    Local,
    Global,
    Specs,
}

/// Runs sub-stages up to and including `max_stage`, stopping early if a
/// sub-stage produces any error-level diagnostic: a failure in stage k
/// aborts every stage after it.
pub fn validate(
    project_root: &Path,
    store: &mut DocumentStore,
    table: &SymbolTable,
    model_assignment: &BTreeMap<BlockRef, Option<SchemaHandle>>,
    max_stage: ValidateStage,
    diagnostics: &mut DiagnosticReport,
) {
    let before = diagnostics.len();
    run_schema_stage(store, model_assignment, diagnostics);
    if max_stage == ValidateStage::Schema || stage_failed(diagnostics, before) {
        return;
    }

    let before = diagnostics.len();
    run_local_stage(store, model_assignment, diagnostics);
    if max_stage == ValidateStage::Local || stage_failed(diagnostics, before) {
        return;
    }

    let before = diagnostics.len();
    run_global_stage(project_root, store, table, model_assignment, diagnostics);
    if max_stage == ValidateStage::Global || stage_failed(diagnostics, before) {
        return;
    }

    crate::spec_runner::run_specs(project_root, store, table, diagnostics);
}

fn stage_failed(diagnostics: &DiagnosticReport, before: usize) -> bool {
    diagnostics
        .iter()
        .skip(before)
        .any(|d| d.level == Level::Error)
}

fn entity_refs(
    store: &DocumentStore,
    model_assignment: &BTreeMap<BlockRef, Option<SchemaHandle>>,
) -> Vec<(BlockRef, Option<SchemaHandle>)> {
    model_assignment
        .iter()
        .filter(|(block_ref, _)| matches!(block_ref, BlockRef::Entity { .. }))
        .map(|(r, s)| (*r, s.clone()))
        .collect::<Vec<_>>()
        .into_iter()
        .filter(|(r, _)| store.resolve(*r).is_some())
        .collect()
}

/// 4.G.1 Schema (L2): structural instantiation with reference-shaped
/// failures suppressed, no field/record validators yet.
fn run_schema_stage(
    store: &mut DocumentStore,
    model_assignment: &BTreeMap<BlockRef, Option<SchemaHandle>>,
    diagnostics: &mut DiagnosticReport,
) {
    for (block_ref, schema) in entity_refs(store, model_assignment) {
        let Some(schema) = schema else {
            continue; // unresolved class name: E0364 reported separately.
        };
        let Schema::Record(record) = &*schema else {
            continue;
        };

        let (location, has_id_key) = {
            let Some(Resolved::Entity(entity)) = store.resolve(block_ref) else {
                continue;
            };
            (
                entity.location.clone(),
                entity.raw_data.as_object().is_some_and(|m| m.contains_key("id")),
            )
        };

        if has_id_key {
            diagnostics.push(
                Diagnostic::new(ErrorCode::E0363, "entity body declares a top-level 'id' key")
                    .with_location(location.clone()),
            );
            continue;
        }

        let Some(Resolved::Entity(entity)) = store.resolve(block_ref) else {
            continue;
        };
        let issues = structural_issues(record, &entity.raw_data);
        if !issues.is_empty() {
            diagnostics.push(
                Diagnostic::new(
                    ErrorCode::E0361,
                    format!("entity '{}' failed structural instantiation", entity.id),
                )
                .with_location(location)
                .with_details(serde_json::json!({ "issues": issues })),
            );
        }
    }
}

/// 4.G.2 Local (L3a): re-instantiate with field and record validators
/// enabled, reference-shaped failures still suppressed.
fn run_local_stage(
    store: &mut DocumentStore,
    model_assignment: &BTreeMap<BlockRef, Option<SchemaHandle>>,
    diagnostics: &mut DiagnosticReport,
) {
    for (block_ref, schema) in entity_refs(store, model_assignment) {
        let Some(schema) = schema else {
            continue;
        };
        let Schema::Record(record) = &*schema else {
            continue;
        };
        let Some(Resolved::Entity(entity)) = store.resolve(block_ref) else {
            continue;
        };
        if entity.raw_data.as_object().is_some_and(|m| m.contains_key("id")) {
            continue; // already reported at the schema stage.
        }

        let mut issues = structural_issues(record, &entity.raw_data);
        issues.extend(field_validator_issues(record, &entity.raw_data));
        issues.extend(record_validator_issues(record, &entity.raw_data));

        if !issues.is_empty() {
            diagnostics.push(
                Diagnostic::new(
                    ErrorCode::E0361,
                    format!("entity '{}' failed local validation", entity.id),
                )
                .with_location(entity.location.clone())
                .with_details(serde_json::json!({ "issues": issues })),
            );
        }
    }
}

fn matches_type(ty: &FieldType, value: &Value) -> bool {
    match ty {
        FieldType::Str => value.is_string(),
        FieldType::Int => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Any => true,
        FieldType::List(inner) => {
            value.is_array() && value.as_array().unwrap().iter().all(|v| matches_type(inner, v))
        }
        FieldType::Map(inner) => {
            value.is_object() && value.as_object().unwrap().values().all(|v| matches_type(inner, v))
        }
        FieldType::Ref(_) => value.is_string(),
    }
}

/// Checks required-field presence and type shape, suppressing mismatches
/// whose offending value is a reference string.
fn structural_issues(record: &RecordSchema, data: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    let object = data.as_object();
    for field in &record.fields {
        let value = object.and_then(|m| m.get(&field.name));
        match value {
            None => {
                if field.required && field.default.is_none() {
                    issues.push(format!("missing required field '{}'", field.name));
                }
            }
            Some(v) => {
                if !matches_type(&field.ty, v) && !looks_like_reference(v) {
                    issues.push(format!("field '{}' does not match its declared type", field.name));
                }
            }
        }
    }
    issues
}

fn field_validator_issues(record: &RecordSchema, data: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    let object = data.as_object();
    for (target, validator) in &record.field_validators {
        let Some(value) = object.and_then(|m| m.get(target)) else {
            continue;
        };
        if looks_like_reference(value) {
            continue;
        }
        if let Err(message) = run_field_validator(validator, value) {
            issues.push(format!("field '{target}': {message}"));
        }
    }
    issues
}

fn run_field_validator(validator: &Validator, value: &Value) -> Result<(), String> {
    let arg = validator.argument.as_deref().unwrap_or("");
    match validator.name.as_str() {
        "required_nonempty" => {
            let empty = match value {
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Null => true,
                _ => false,
            };
            if empty {
                Err("must not be empty".to_string())
            } else {
                Ok(())
            }
        }
        "min_len" => {
            let n: usize = arg.parse().map_err(|_| "invalid min_len argument".to_string())?;
            let len = value_len(value);
            (len >= n).then_some(()).ok_or_else(|| format!("length {len} is below minimum {n}"))
        }
        "max_len" => {
            let n: usize = arg.parse().map_err(|_| "invalid max_len argument".to_string())?;
            let len = value_len(value);
            (len <= n).then_some(()).ok_or_else(|| format!("length {len} exceeds maximum {n}"))
        }
        "one_of" => {
            let allowed: Vec<&str> = arg.split(',').map(str::trim).collect();
            let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            allowed
                .contains(&text.as_str())
                .then_some(())
                .ok_or_else(|| format!("'{text}' is not one of {allowed:?}"))
        }
        "matches_regex" => {
            let re = Regex::new(arg).map_err(|e| format!("invalid regex: {e}"))?;
            let text = value.as_str().ok_or_else(|| "expected a string".to_string())?;
            re.is_match(text)
                .then_some(())
                .ok_or_else(|| format!("'{text}' does not match {arg}"))
        }
        "range" => {
            let (min, max) = arg
                .split_once(',')
                .ok_or_else(|| "invalid range argument".to_string())?;
            let min: f64 = min.trim().parse().map_err(|_| "invalid range min".to_string())?;
            let max: f64 = max.trim().parse().map_err(|_| "invalid range max".to_string())?;
            let n = value.as_f64().ok_or_else(|| "expected a number".to_string())?;
            (n >= min && n <= max)
                .then_some(())
                .ok_or_else(|| format!("{n} is outside range [{min}, {max}]"))
        }
        other => Err(format!("unknown validator '{other}'")),
    }
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        _ => 0,
    }
}

fn record_validator_issues(record: &RecordSchema, data: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    let object = data.as_object();
    for validator in &record.record_validators {
        let fields: Vec<&str> = validator
            .argument
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .collect();
        let present = fields
            .iter()
            .filter(|f| object.is_some_and(|m| m.get(**f).is_some_and(|v| !v.is_null())))
            .count();
        match validator.name.as_str() {
            "at_least_one_of" => {
                if present == 0 {
                    issues.push(format!("at least one of {fields:?} must be set"));
                }
            }
            "mutually_exclusive" => {
                if present > 1 {
                    issues.push(format!("at most one of {fields:?} may be set"));
                }
            }
            other => issues.push(format!("unknown record validator '{other}'")),
        }
    }
    issues
}

/// Strips an exact `[[...]]` wrapper, returning the inner text.
fn strip_reference_wrapper(text: &str) -> Option<&str> {
    let text = text.trim();
    text.strip_prefix("[[").and_then(|s| s.strip_suffix("]]"))
}

/// 4.G.3 Global (L3b): build the `former` dependency graph, topologically
/// sort it, then resolve references entity-by-entity in that order.
fn run_global_stage(
    project_root: &Path,
    store: &mut DocumentStore,
    table: &SymbolTable,
    model_assignment: &BTreeMap<BlockRef, Option<SchemaHandle>>,
    diagnostics: &mut DiagnosticReport,
) {
    let mut graph = DependencyGraph::new();
    let mut id_to_ref: BTreeMap<String, BlockRef> = BTreeMap::new();
    let mut former_targets: BTreeMap<String, String> = BTreeMap::new();

    for block_ref in table.iter_entities() {
        let Some(Resolved::Entity(entity)) = store.resolve(block_ref) else {
            continue;
        };
        id_to_ref.insert(entity.id.clone(), block_ref);
        graph.ensure_node(&entity.id);
        if let Some(former) = entity.raw_data.get("former").and_then(Value::as_str) {
            if let Some(inner) = strip_reference_wrapper(former) {
                let (root, _) = split_query(inner);
                graph.add_edge(&entity.id, root);
                former_targets.insert(entity.id.clone(), root.to_string());
            }
        }
    }

    let order = match graph.topological_sort() {
        Ok(order) => order,
        Err(cycle_error) => {
            diagnostics.push(
                Diagnostic::new(ErrorCode::E0342, "dependency cycle detected among entities")
                    .with_details(serde_json::json!({ "cycle": cycle_error.cycle })),
            );
            return;
        }
    };

    let engine = QueryEngine::new(table, store, project_root);
    let mut resolved: BTreeMap<BlockRef, Value> = BTreeMap::new();
    let mut entity_errors: BTreeMap<BlockRef, Vec<(String, SourceLocation)>> = BTreeMap::new();

    for id in &order {
        let Some(&block_ref) = id_to_ref.get(id) else {
            continue;
        };
        let Some(Resolved::Entity(entity)) = engine.store.resolve(block_ref) else {
            continue;
        };

        if let Some(former_root) = former_targets.get(id) {
            let target_is_entity = Identifier::parse(former_root.as_str());
            let former_ref = match &target_is_entity {
                Identifier::Hash(hex) => table.resolve_hash(hex),
                Identifier::Id(name) => table.resolve_id(name, &entity.location.file_path, project_root),
            };
            let is_entity = former_ref.is_some_and(|r| matches!(engine.store.resolve(r), Some(Resolved::Entity(_))));
            if !is_entity {
                diagnostics.push(
                    Diagnostic::new(
                        ErrorCode::E0343,
                        format!("'former' target '{former_root}' does not resolve to an entity"),
                    )
                    .with_location(entity.location.clone()),
                );
            }
        }

        let mut errors = Vec::new();
        let resolved_value = resolve_value(&engine, &entity.raw_data, &entity.location.file_path, &mut errors);
        if errors.is_empty() {
            resolved.insert(block_ref, resolved_value);
        } else {
            entity_errors.insert(
                block_ref,
                errors.into_iter().map(|m| (m, entity.location.clone())).collect(),
            );
        }
    }

    for (block_ref, errs) in entity_errors {
        for (message, location) in errs {
            diagnostics.push(Diagnostic::new(ErrorCode::E0341, message).with_location(location));
        }
        let _ = block_ref;
    }

    for (block_ref, value) in resolved {
        if let Some(entity) = store.resolve_entity_mut(block_ref) {
            entity.resolved_data = Some(value);
        }
    }

    check_reference_types(project_root, store, table, model_assignment, diagnostics);
}

/// Recursively resolves every `[[...]]` occurrence in `value`, collecting
/// per-occurrence error messages instead of swallowing them (spec
/// §4.G.3.3).
fn resolve_value(
    engine: &QueryEngine,
    value: &Value,
    context_path: &Path,
    errors: &mut Vec<String>,
) -> Value {
    match value {
        Value::String(s) => match engine.resolve_string(s, context_path) {
            Ok(v) => v,
            Err(e) => {
                errors.push(e.message().to_string());
                Value::String(s.clone())
            }
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(engine, v, context_path, errors))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(engine, v, context_path, errors));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// 4.G.3 step 4: semantic reference typing — every `Ref[T]` field's
/// resolved target's class name must be in the admissible set.
fn check_reference_types(
    project_root: &Path,
    store: &DocumentStore,
    table: &SymbolTable,
    model_assignment: &BTreeMap<BlockRef, Option<SchemaHandle>>,
    diagnostics: &mut DiagnosticReport,
) {
    for (block_ref, schema) in entity_refs(store, model_assignment) {
        let Some(schema) = schema else {
            continue;
        };
        let Schema::Record(record) = &*schema else {
            continue;
        };
        let Some(Resolved::Entity(entity)) = store.resolve(block_ref) else {
            continue;
        };
        let object = match entity.raw_data.as_object() {
            Some(o) => o,
            None => continue,
        };

        for field in &record.fields {
            let Some(targets) = field.ty.reference_targets() else {
                continue;
            };
            let Some(value) = object.get(&field.name) else {
                continue;
            };
            let raw_strings: Vec<&str> = match (&field.ty, value) {
                (FieldType::List(_), Value::Array(items)) => {
                    items.iter().filter_map(Value::as_str).collect()
                }
                (_, Value::String(s)) => vec![s.as_str()],
                _ => Vec::new(),
            };
            for raw in raw_strings {
                let Some(inner) = strip_reference_wrapper(raw) else {
                    continue;
                };
                let (root, _) = split_query(inner);
                let identifier = Identifier::parse(root);
                let found = match &identifier {
                    Identifier::Hash(hex) => table.resolve_hash(hex),
                    Identifier::Id(name) => {
                        table.resolve_id(name, &entity.location.file_path, project_root)
                    }
                };
                let Some(found) = found else {
                    continue; // already reported as E0341.
                };
                let actual_class = match store.resolve(found) {
                    Some(Resolved::Entity(target)) => Some(target.class_name.clone()),
                    Some(Resolved::Model(_)) => None,
                    None => None,
                };
                let actual = actual_class.unwrap_or_else(|| "<model>".to_string());
                if !targets.contains(&actual) {
                    diagnostics.push(
                        Diagnostic::new(
                            ErrorCode::E0362,
                            format!(
                                "field '{}' expects one of {:?}, target is '{}'",
                                field.name, targets, actual
                            ),
                        )
                        .with_location(entity.location.clone())
                        .with_details(serde_json::json!({
                            "expected": targets.join(","),
                            "actual": actual,
                        })),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema;

    #[test]
    fn structural_issues_flags_missing_required_field() {
        let schema = parse_schema("record User { name: str, email: str }").unwrap();
        let record = schema.as_record().unwrap();
        let data = serde_json::json!({ "name": "Alice" });
        let issues = structural_issues(record, &data);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("email"));
    }

    #[test]
    fn structural_issues_suppresses_reference_shaped_value() {
        let schema = parse_schema("record Order { buyer: Ref[User] }").unwrap();
        let record = schema.as_record().unwrap();
        let data = serde_json::json!({ "buyer": "[[alice]]" });
        assert!(structural_issues(record, &data).is_empty());
    }

    #[test]
    fn field_validator_matches_regex() {
        let validator = Validator {
            name: "matches_regex".to_string(),
            argument: Some("^[^@]+@[^@]+$".to_string()),
        };
        assert!(run_field_validator(&validator, &Value::String("a@b".to_string())).is_ok());
        assert!(run_field_validator(&validator, &Value::String("not-an-email".to_string())).is_err());
    }

    #[test]
    fn record_validator_mutually_exclusive() {
        let schema = parse_schema(
            r#"record Payment { card: str = "", bank: str = "" } @validate_record("mutually_exclusive:card,bank")"#,
        )
        .unwrap();
        let record = schema.as_record().unwrap();
        let data = serde_json::json!({ "card": "4111", "bank": "1234" });
        let issues = record_validator_issues(record, &data);
        assert_eq!(issues.len(), 1);
    }
}
