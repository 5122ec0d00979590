//! Spec-block execution (code range `E04xx`). Like the schema grammar,
//! spec bodies are parsed as a small declarative assertion language rather
//! than executed as arbitrary scripting code — the same redesign applied
//! consistently to every originally-scripted surface: models, config, and
//! specs.

use std::path::Path;

use serde_json::Value;

use crate::diagnostic::{Diagnostic, DiagnosticReport, ErrorCode, Level};
use crate::document::{SourceLocation, SpecScope};
use crate::query::QueryEngine;
use crate::symbol_table::{DocumentStore, Resolved, SymbolTable};

enum Directive {
    Assert { query: String, op: String, literal: Value },
    Exists { query: String },
    NotExists { query: String },
    Report { message: String },
}

fn parse_literal(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Some(inner) = s.strip_prefix('"').and_then(|x| x.strip_suffix('"')) {
        return Some(Value::String(inner.to_string()));
    }
    match s {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(Value::Number(n.into()));
    }
    s.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number)
}

/// Splits `line` on top-level whitespace: whitespace inside a `"..."`
/// quoted span or a `(...)`/`[...]` nesting doesn't end a token, so a
/// `find_all(...)`/`sql(...)` call — whose arguments routinely contain
/// spaces, e.g. a SQL string — survives as one token.
fn split_top_level(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '(' | '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' if !in_quotes => {
                depth -= 1;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_directive(line: &str) -> Option<Directive> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
        return None;
    }
    let mut tokens = line.splitn(2, char::is_whitespace);
    let keyword = tokens.next()?;
    let rest = tokens.next().unwrap_or("").trim();
    match keyword {
        "assert" => {
            let parts = split_top_level(rest);
            if parts.len() < 3 {
                return None;
            }
            let query = parts[0].clone();
            let op = parts[1].clone();
            let literal = parse_literal(&parts[2])?;
            Some(Directive::Assert { query, op, literal })
        }
        "exists" => Some(Directive::Exists { query: rest.to_string() }),
        "not_exists" => Some(Directive::NotExists { query: rest.to_string() }),
        "report" => {
            let message = rest.trim_matches('"').to_string();
            Some(Directive::Report { message })
        }
        _ => None,
    }
}

fn substitute_self(query: &str, self_id: Option<&str>) -> String {
    match self_id {
        Some(id) if query == "self" => id.to_string(),
        Some(id) => match query.strip_prefix("self.") {
            Some(rest) => format!("{id}.{rest}"),
            None => query.to_string(),
        },
        None => query.to_string(),
    }
}

pub(crate) fn compare(value: &Value, op: &str, literal: &Value) -> bool {
    match op {
        "==" => value == literal,
        "!=" => value != literal,
        ">" | ">=" | "<" | "<=" => match (value.as_f64(), literal.as_f64()) {
            (Some(a), Some(b)) => match op {
                ">" => a > b,
                ">=" => a >= b,
                "<" => a < b,
                "<=" => a <= b,
                _ => unreachable!(),
            },
            _ => false,
        },
        _ => false,
    }
}

/// Executes one spec body's directives against a bound scope (`self_id` is
/// `Some` for a local-scope spec run once per matching entity).
fn execute_body(
    body: &str,
    engine: &QueryEngine,
    context_path: &Path,
    self_id: Option<&str>,
    location: &SourceLocation,
    diagnostics: &mut DiagnosticReport,
) {
    for line in body.lines() {
        let Some(directive) = parse_directive(line) else {
            continue;
        };
        match directive {
            Directive::Assert { query, op, literal } => {
                let q = substitute_self(&query, self_id);
                match engine.resolve_query(&q, context_path) {
                    Ok(value) => {
                        if !compare(&value, &op, &literal) {
                            diagnostics.push(
                                Diagnostic::new(
                                    ErrorCode::E0424,
                                    format!("assertion failed: {q} {op} {literal}"),
                                )
                                .with_location(location.clone()),
                            );
                        }
                    }
                    Err(e) => {
                        diagnostics.push(
                            Diagnostic::new(
                                ErrorCode::E0421,
                                format!("spec raised while evaluating '{q}': {e}"),
                            )
                            .with_location(location.clone()),
                        );
                    }
                }
            }
            Directive::Exists { query } => {
                let q = substitute_self(&query, self_id);
                if engine.resolve_query(&q, context_path).is_err() {
                    diagnostics.push(
                        Diagnostic::new(ErrorCode::E0424, format!("expected '{q}' to exist"))
                            .with_location(location.clone()),
                    );
                }
            }
            Directive::NotExists { query } => {
                let q = substitute_self(&query, self_id);
                if engine.resolve_query(&q, context_path).is_ok() {
                    diagnostics.push(
                        Diagnostic::new(ErrorCode::E0424, format!("expected '{q}' to not exist"))
                            .with_location(location.clone()),
                    );
                }
            }
            Directive::Report { message } => {
                diagnostics.push(
                    Diagnostic::new(ErrorCode::E0424, message).with_location(location.clone()),
                );
            }
        }
    }
}

/// Runs every SpecBlock in document-walk order: local-scope specs once per
/// matching entity, global-scope (or selector-less) specs once each.
pub fn run_specs(
    project_root: &Path,
    store: &DocumentStore,
    table: &SymbolTable,
    diagnostics: &mut DiagnosticReport,
) {
    let engine = QueryEngine::new(table, store, project_root);

    for document in store.documents() {
        for spec in &document.specs {
            match &spec.selector {
                None => {
                    execute_body(&spec.body, &engine, &document.path, None, &spec.location, diagnostics);
                }
                Some(selector) if selector.scope == SpecScope::Global => {
                    execute_body(&spec.body, &engine, &document.path, None, &spec.location, diagnostics);
                }
                Some(selector) => {
                    let matching: Vec<&str> = table
                        .iter_entities()
                        .filter_map(|block_ref| match store.resolve(block_ref) {
                            Some(Resolved::Entity(e)) if e.class_name == selector.kind => {
                                Some(e.id.as_str())
                            }
                            _ => None,
                        })
                        .collect();

                    if matching.is_empty() {
                        diagnostics.push(
                            Diagnostic::new(
                                ErrorCode::E0423,
                                format!("selector matched no entities of class '{}'", selector.kind),
                            )
                            .with_level(Level::Warning)
                            .with_location(spec.location.clone()),
                        );
                        continue;
                    }

                    for id in matching {
                        execute_body(
                            &spec.body,
                            &engine,
                            &document.path,
                            Some(id),
                            &spec.location,
                            diagnostics,
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assert_and_report_directives() {
        assert!(matches!(
            parse_directive("assert alice.age > 17"),
            Some(Directive::Assert { .. })
        ));
        assert!(matches!(
            parse_directive(r#"report "bad state""#),
            Some(Directive::Report { .. })
        ));
        assert!(parse_directive("# a comment").is_none());
        assert!(parse_directive("@target(User, local)").is_none());
    }

    #[test]
    fn assert_directive_keeps_sql_call_with_spaces_as_one_token() {
        let directive = parse_directive(
            r#"assert sql("SELECT sum(weight) as total FROM Item")[0].total <= 10000"#,
        );
        match directive {
            Some(Directive::Assert { query, op, literal }) => {
                assert_eq!(
                    query,
                    r#"sql("SELECT sum(weight) as total FROM Item")[0].total"#
                );
                assert_eq!(op, "<=");
                assert_eq!(literal, Value::from(10000));
            }
            _ => panic!("expected an Assert directive"),
        }
    }

    #[test]
    fn substitute_self_rewrites_leading_token() {
        assert_eq!(substitute_self("self.age", Some("alice")), "alice.age");
        assert_eq!(substitute_self("self", Some("alice")), "alice");
        assert_eq!(substitute_self("other.age", Some("alice")), "other.age");
    }

    #[test]
    fn compare_handles_numeric_and_equality_ops() {
        let five = Value::from(5);
        let three = Value::from(3);
        assert!(compare(&five, ">", &three));
        assert!(!compare(&three, ">", &five));
        assert!(compare(&five, "==", &Value::from(5)));
    }
}
