//! The Query Engine: resolves a reference string to a value by
//! parsing it into an identifier, dispatching to the symbol table, and
//! walking a dotted/indexed property path. Used both by the validator
//! during reference resolution and directly by the CLI/LSP for ad-hoc
//! queries.

use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::diagnostic::ErrorCode;
use crate::identifier::{split_query, Identifier};
use crate::symbol_table::{DocumentStore, Resolved, SymbolTable};

/// `name` or `name[index]`, matching the original query engine's property
/// path grammar: a bare `*` is handled separately as it is only legal as
/// the final segment.
static PATH_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)(?:\[(\d+)\])?$").unwrap());

static REFERENCE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[(.*?)\]\]").unwrap());

/// `find_all(...)` or `sql(...)` at the head of a query string.
static BUILTIN_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(find_all|sql)\(").unwrap());

static AND_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+and\s+").unwrap());

static PREDICATE_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*(==|!=|>=|<=|>|<)\s*(.+)$").unwrap());

static AGG_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(sum|count|avg|min|max)\((\*|\w+)\)(?:\s+as\s+(\w+))?$").unwrap()
});

static PARAM_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\w+)").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The root identifier did not resolve to anything (`E0341`).
    Reference(String),
    /// A property-path segment was missing, out of bounds, or malformed
    /// (`E0365`).
    Segment(String),
}

impl QueryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueryError::Reference(_) => ErrorCode::E0341,
            QueryError::Segment(_) => ErrorCode::E0365,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            QueryError::Reference(m) | QueryError::Segment(m) => m,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Bundles the read-only state a query needs: the symbol table, the
/// document store backing its `BlockRef`s, and the project root that
/// bounds scoped lookup walks.
pub struct QueryEngine<'a> {
    pub table: &'a SymbolTable,
    pub store: &'a DocumentStore,
    pub project_root: &'a Path,
}

impl<'a> QueryEngine<'a> {
    pub fn new(table: &'a SymbolTable, store: &'a DocumentStore, project_root: &'a Path) -> Self {
        QueryEngine {
            table,
            store,
            project_root,
        }
    }

    /// Resolves `query` against `context_path` (the file the query
    /// originates from, for scoped `Id` lookup). A query whose root is a
    /// `find_all(...)`/`sql(...)` call is dispatched to the ambient
    /// lookup primitives over the entity tabular view instead of symbol
    /// table resolution; the call's result then still accepts a trailing
    /// property path (`sql("...")[0].total`).
    pub fn resolve_query(&self, query: &str, context_path: &Path) -> Result<Value, QueryError> {
        if let Some((name, args, suffix)) = parse_builtin_call(query) {
            let value = self.call_builtin(name, args)?;
            if suffix.is_empty() {
                return Ok(value);
            }
            return apply_call_suffix(value, suffix, query);
        }

        let (root, property_path) = split_query(query);
        let identifier = Identifier::parse(root);

        let resolved = match &identifier {
            Identifier::Hash(hex) => self.table.resolve_hash(hex),
            Identifier::Id(name) => self.table.resolve_id(name, context_path, self.project_root),
        };

        let Some(block_ref) = resolved else {
            return Err(QueryError::Reference(format!(
                "reference not found: '{root}'"
            )));
        };

        let Some(resolved) = self.store.resolve(block_ref) else {
            return Err(QueryError::Reference(format!(
                "reference not found: '{root}'"
            )));
        };

        let base = match &resolved {
            Resolved::Entity(entity) => entity.effective_data().clone(),
            Resolved::Model(model) => Value::String(model.name.clone()),
        };

        if property_path.is_empty() {
            return Ok(base);
        }
        traverse_property_path(base, &property_path, query)
    }

    /// Resolves every `[[...]]` occurrence inside `text`. An exact match
    /// (`text == "[[expr]]"`) returns the resolved value with its original
    /// type preserved; mixed content stringifies each occurrence and
    /// splices it in, leaving unresolved occurrences untouched.
    pub fn resolve_string(&self, text: &str, context_path: &Path) -> Result<Value, QueryError> {
        if let Some(caps) = full_reference_match(text) {
            return self.resolve_query(&caps, context_path);
        }

        if !REFERENCE_PATTERN.is_match(text) {
            return Ok(Value::String(text.to_string()));
        }

        let mut failed = false;
        let spliced = REFERENCE_PATTERN.replace_all(text, |caps: &regex::Captures| {
            match self.resolve_query(&caps[1], context_path) {
                Ok(value) => stringify(&value),
                Err(_) => {
                    failed = true;
                    caps[0].to_string()
                }
            }
        });
        if failed {
            // At least one occurrence failed to resolve; the caller still
            // gets the best-effort spliced string (unresolved occurrences
            // left intact) but should also emit a diagnostic.
            return Err(QueryError::Reference(format!(
                "one or more references in '{text}' failed to resolve: {spliced}"
            )));
        }
        Ok(Value::String(spliced.into_owned()))
    }

    /// Recursively resolves references inside an arbitrary JSON value,
    /// walking the whole payload rather than just top-level string fields.
    pub fn evaluate_data(&self, value: &Value, context_path: &Path) -> Value {
        match value {
            Value::String(s) => self
                .resolve_string(s, context_path)
                .unwrap_or_else(|_| Value::String(s.clone())),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.evaluate_data(v, context_path))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.evaluate_data(v, context_path));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn call_builtin(&self, name: &str, args: &str) -> Result<Value, QueryError> {
        let args = split_call_args(args);
        match name {
            "find_all" => {
                let type_name = args.first().and_then(Value::as_str).ok_or_else(|| {
                    QueryError::Segment("find_all(...) requires a type name argument".to_string())
                })?;
                let predicate = args.get(1).and_then(Value::as_str);
                Ok(Value::Array(self.find_all(type_name, predicate)))
            }
            "sql" => {
                let query_text = args.first().and_then(Value::as_str).ok_or_else(|| {
                    QueryError::Segment("sql(...) requires a query string argument".to_string())
                })?;
                self.sql(query_text, args.get(1))
            }
            _ => Err(QueryError::Reference(format!("unknown function '{name}'"))),
        }
    }

    /// `find_all(type_name, predicate?)`: every entity of `type_name`,
    /// each rendered as its effective data with `id` merged in, optionally
    /// filtered by a `field op literal [and field op literal ...]`
    /// predicate over that rendering. This and [`QueryEngine::sql`] both
    /// read the same entity tabular view: one row per entity, one column
    /// per field plus `id`.
    pub fn find_all(&self, type_name: &str, predicate: Option<&str>) -> Vec<Value> {
        let clauses = predicate.map(parse_predicate).unwrap_or_default();
        let mut rows = Vec::new();
        for block_ref in self.table.iter_entities() {
            let Some(Resolved::Entity(entity)) = self.store.resolve(block_ref) else {
                continue;
            };
            if entity.class_name != type_name {
                continue;
            }
            let mut row = match entity.effective_data().as_object() {
                Some(map) => map.clone(),
                None => serde_json::Map::new(),
            };
            row.insert("id".to_string(), Value::String(entity.id.clone()));
            let row = Value::Object(row);
            if clauses
                .iter()
                .all(|(field, op, literal)| match row.get(field) {
                    Some(value) => crate::spec_runner::compare(value, op, literal),
                    None => false,
                })
            {
                rows.push(row);
            }
        }
        rows
    }

    /// `sql(query, params?)`: a closed `SELECT <cols> FROM <Type> [WHERE
    /// <predicate>]` subset over the entity tabular view — no joins, no
    /// subqueries, no general SQL. `cols` is `*`, a comma list of field
    /// names, or a comma list of `sum`/`count`/`avg`/`min`/`max`
    /// aggregates (each optionally `AS alias`); an all-aggregate select
    /// collapses every matching row into a single aggregate row, matching
    /// the original implementation's `sql("SELECT sum(weight) AS total
    /// FROM Item")`-style usage. `params` binds `:name` placeholders in
    /// `query` to literal values before parsing.
    pub fn sql(&self, query: &str, params: Option<&Value>) -> Result<Value, QueryError> {
        let substituted = substitute_params(query, params);
        let parsed = parse_sql(&substituted)?;
        let rows = self.find_all(&parsed.table, parsed.predicate.as_deref());

        if !parsed.columns.is_empty()
            && parsed
                .columns
                .iter()
                .all(|c| matches!(c, SqlColumn::Agg { .. }))
        {
            let mut row = serde_json::Map::new();
            for column in &parsed.columns {
                if let SqlColumn::Agg { func, field, alias } = column {
                    row.insert(alias.clone(), aggregate(func, field.as_deref(), &rows));
                }
            }
            return Ok(Value::Array(vec![Value::Object(row)]));
        }

        Ok(Value::Array(
            rows.iter().map(|row| project_row(row, &parsed.columns)).collect(),
        ))
    }
}

/// If `query` opens with `find_all(` or `sql(`, returns the call name, the
/// raw argument text between the matching parens (quote-aware, so commas
/// and parens inside a quoted SQL string don't confuse the split), and
/// whatever trails the closing paren (a property-path suffix, or empty).
fn parse_builtin_call(query: &str) -> Option<(&str, &str, &str)> {
    let caps = BUILTIN_CALL.captures(query)?;
    let name = caps.get(1)?.as_str();
    let open = caps.get(0)?.end() - 1;

    let mut depth = 0i32;
    let mut in_quotes = false;
    for (i, c) in query.char_indices().skip(open) {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth -= 1;
                if depth == 0 {
                    return Some((name, &query[open + 1..i], &query[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits a call's argument text on top-level commas (not inside quotes or
/// `{...}`/`[...]` nesting) and parses each argument into a `Value`: a
/// quoted string, a `{...}` object literal (parsed as JSON, for `sql`'s
/// `params`), `true`/`false`/`null`, a number, or — for bare words like
/// `find_all(User)` — a plain string.
fn split_call_args(args: &str) -> Vec<Value> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    for c in args.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '{' | '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            '}' | ']' if !in_quotes => {
                depth -= 1;
                current.push(c);
            }
            ',' if !in_quotes && depth == 0 => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    tokens.push(current);
    tokens.iter().map(|t| parse_arg_token(t.trim())).collect()
}

fn parse_arg_token(token: &str) -> Value {
    if let Some(inner) = token.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Value::String(inner.to_string());
    }
    if token.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<Value>(token) {
            return v;
        }
    }
    match token {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = token.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(token.to_string())
}

/// Parses a `field op literal [and field op literal ...]` predicate (the
/// same shape `find_all`'s second argument and `sql`'s `WHERE` clause
/// both use) into `(field, op, literal)` clauses, all of which must hold.
fn parse_predicate(text: &str) -> Vec<(String, String, Value)> {
    AND_SPLIT
        .split(text.trim())
        .filter(|part| !part.trim().is_empty())
        .filter_map(|part| {
            let caps = PREDICATE_CLAUSE.captures(part.trim())?;
            let field = caps[1].to_string();
            let op = caps[2].to_string();
            let literal = parse_arg_token(caps[3].trim());
            Some((field, op, literal))
        })
        .collect()
}

/// Applies a property-path suffix (`[0].total`, `.name`, or empty) to a
/// value already produced by a `find_all`/`sql` call.
fn apply_call_suffix(mut current: Value, suffix: &str, original_query: &str) -> Result<Value, QueryError> {
    let mut rest = suffix;
    if let Some(after_bracket) = rest.strip_prefix('[') {
        let end = after_bracket.find(']').ok_or_else(|| {
            QueryError::Segment(format!("unterminated index in '{original_query}'"))
        })?;
        let idx: usize = after_bracket[..end].parse().map_err(|_| {
            QueryError::Segment(format!("invalid index in '{original_query}'"))
        })?;
        current = match current {
            Value::Array(mut items) => {
                if idx >= items.len() {
                    return Err(QueryError::Segment(format!(
                        "index {idx} out of range in '{original_query}'"
                    )));
                }
                items.swap_remove(idx)
            }
            _ => {
                return Err(QueryError::Segment(format!(
                    "'{original_query}' does not index a list"
                )))
            }
        };
        rest = &after_bracket[end + 1..];
    }
    let rest = rest.strip_prefix('.').unwrap_or(rest);
    if rest.is_empty() {
        return Ok(current);
    }
    let segments: Vec<&str> = rest.split('.').collect();
    traverse_property_path(current, &segments, original_query)
}

#[derive(Debug, Clone)]
enum SqlColumn {
    Star,
    Field(String),
    Agg {
        func: String,
        field: Option<String>,
        alias: String,
    },
}

struct SqlQuery {
    columns: Vec<SqlColumn>,
    table: String,
    predicate: Option<String>,
}

/// Parses the closed `SELECT <cols> FROM <Type> [WHERE <predicate>]`
/// subset `sql(...)` accepts. Case-insensitive keywords, a single table
/// (no joins), and a predicate in the same grammar `find_all`'s second
/// argument uses.
fn parse_sql(query: &str) -> Result<SqlQuery, QueryError> {
    let q = query.trim();
    let upper = q.to_uppercase();
    if !upper.starts_with("SELECT ") {
        return Err(QueryError::Segment(format!(
            "sql query must start with SELECT: '{query}'"
        )));
    }
    let from_idx = upper.find(" FROM ").ok_or_else(|| {
        QueryError::Segment(format!("sql query missing FROM clause: '{query}'"))
    })?;
    let select_part = q[7..from_idx].trim();
    let rest = q[from_idx + 6..].trim();
    let rest_upper = rest.to_uppercase();
    let (table, predicate) = match rest_upper.find(" WHERE ") {
        Some(widx) => (
            rest[..widx].trim().to_string(),
            Some(rest[widx + 7..].trim().to_string()),
        ),
        None => (rest.to_string(), None),
    };
    if table.is_empty() {
        return Err(QueryError::Segment(format!(
            "sql query missing table name: '{query}'"
        )));
    }

    let columns = if select_part == "*" {
        vec![SqlColumn::Star]
    } else {
        select_part
            .split(',')
            .map(|c| parse_sql_column(c.trim()))
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(SqlQuery {
        columns,
        table,
        predicate,
    })
}

fn parse_sql_column(text: &str) -> Result<SqlColumn, QueryError> {
    if let Some(caps) = AGG_COLUMN.captures(text) {
        let func = caps[1].to_lowercase();
        let field = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .filter(|s| s != "*");
        let alias = caps
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| func.clone());
        return Ok(SqlColumn::Agg { func, field, alias });
    }
    if text.chars().all(|c| c.is_alphanumeric() || c == '_') && !text.is_empty() {
        return Ok(SqlColumn::Field(text.to_string()));
    }
    Err(QueryError::Segment(format!("invalid select column '{text}'")))
}

fn aggregate(func: &str, field: Option<&str>, rows: &[Value]) -> Value {
    if func == "count" {
        return Value::from(rows.len() as i64);
    }
    let Some(field) = field else {
        return Value::Null;
    };
    let numbers: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.get(field))
        .filter_map(Value::as_f64)
        .collect();
    match func {
        "sum" => Value::from(numbers.iter().sum::<f64>()),
        "avg" if !numbers.is_empty() => {
            Value::from(numbers.iter().sum::<f64>() / numbers.len() as f64)
        }
        "min" => numbers
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.min(x))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        "max" => numbers
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.max(x))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn project_row(row: &Value, columns: &[SqlColumn]) -> Value {
    if columns.iter().any(|c| matches!(c, SqlColumn::Star)) {
        return row.clone();
    }
    let mut out = serde_json::Map::new();
    if let Value::Object(map) = row {
        for column in columns {
            if let SqlColumn::Field(name) = column {
                if let Some(v) = map.get(name) {
                    out.insert(name.clone(), v.clone());
                }
            }
        }
    }
    Value::Object(out)
}

/// Substitutes `:name` placeholders in a `sql(...)` query string with the
/// corresponding value from `params` (a JSON object), quoting strings the
/// way inline SQL literals are quoted. Placeholders absent from `params`
/// are left untouched.
fn substitute_params(query: &str, params: Option<&Value>) -> String {
    let Some(Value::Object(map)) = params else {
        return query.to_string();
    };
    PARAM_TOKEN
        .replace_all(query, |caps: &regex::Captures| {
            let name = &caps[1];
            match map.get(name) {
                Some(Value::String(s)) => format!("'{s}'"),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn full_reference_match(text: &str) -> Option<String> {
    let trimmed = text;
    if trimmed.starts_with("[[") && trimmed.ends_with("]]") {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("[[") && !inner.contains("]]") {
            return Some(inner.to_string());
        }
    }
    None
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Walks `property_path` segment by segment over `current`: `name` is
/// field/map access, `name[i]` additionally indexes a sequence, and a bare
/// `*` — legal only as the final segment — returns the entire resolved
/// payload unchanged.
fn traverse_property_path(
    mut current: Value,
    property_path: &[&str],
    original_query: &str,
) -> Result<Value, QueryError> {
    for (i, part) in property_path.iter().enumerate() {
        if *part == "*" {
            if i == property_path.len() - 1 {
                return Ok(current);
            }
            return Err(QueryError::Segment(format!(
                "'*' must be the final segment in '{original_query}'"
            )));
        }

        let caps = PATH_SEGMENT.captures(part).ok_or_else(|| {
            QueryError::Segment(format!("invalid path segment '{part}' in '{original_query}'"))
        })?;
        let name = &caps[1];
        let index = caps.get(2).map(|m| m.as_str());

        current = match current {
            Value::Object(mut map) => map.remove(name).ok_or_else(|| {
                QueryError::Segment(format!("segment '{name}' not found in '{original_query}'"))
            })?,
            _ => {
                return Err(QueryError::Segment(format!(
                    "segment '{name}' not found in '{original_query}'"
                )))
            }
        };

        if let Some(index) = index {
            let idx: usize = index.parse().expect("regex guarantees digits");
            current = match current {
                Value::Array(mut items) => {
                    if idx >= items.len() {
                        return Err(QueryError::Segment(format!(
                            "index {idx} out of range in segment '{part}'"
                        )));
                    }
                    items.swap_remove(idx)
                }
                _ => {
                    return Err(QueryError::Segment(format!(
                        "segment '{name}' is not a list, cannot index in '{original_query}'"
                    )))
                }
            };
        }
    }
    Ok(current)
}
