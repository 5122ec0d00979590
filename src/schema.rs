//! The declarative schema grammar: model bodies are parsed at load time
//! into typed schema objects rather than executed as arbitrary code, via a
//! small language of field-type expressions, validator predicates, and
//! reference declarations:
//!
//! ```text
//! record User {
//!     name: str,
//!     email: str,
//!     age: int = 0,
//!     manager: Ref[User],
//! }
//! @validate(email, "matches_regex:^[^@]+@[^@]+$")
//!
//! enum Status { Draft, Published, Archived }
//! ```

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use serde_json::Value;

use crate::error::TypedownError;

/// The type of a field. `Ref[T1, T2, ...]` admits a set of target model
/// names, for fields that may point at more than one class of entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Any,
    List(Box<FieldType>),
    Map(Box<FieldType>),
    Ref(Vec<String>),
}

impl FieldType {
    pub fn target_types(&self) -> Option<&[String]> {
        match self {
            FieldType::Ref(targets) => Some(targets),
            _ => None,
        }
    }

    /// The reference target set of this field, recursing into list element
    /// types so a `list[Ref[T]]` field is still recognised as reference-typed.
    pub fn reference_targets(&self) -> Option<&[String]> {
        match self {
            FieldType::Ref(targets) => Some(targets),
            FieldType::List(inner) => inner.reference_targets(),
            _ => None,
        }
    }

    /// True for a field type that is, or contains, a reference.
    pub fn is_reference(&self) -> bool {
        self.reference_targets().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<Value>,
}

/// A named predicate bound to a field or to the whole record, e.g.
/// `@validate(email, "matches_regex:^...$")`.
#[derive(Debug, Clone)]
pub struct Validator {
    pub name: String,
    pub argument: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub field_validators: Vec<(String, Validator)>,
    pub record_validators: Vec<Validator>,
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_reserved_id_field(&self) -> bool {
        self.fields.iter().any(|f| f.name == "id")
    }
}

/// Field validator predicates the host implements natively.
pub const FIELD_VALIDATOR_NAMES: &[&str] = &[
    "required_nonempty",
    "min_len",
    "max_len",
    "one_of",
    "matches_regex",
    "range",
];

/// Record-level validator predicates.
pub const RECORD_VALIDATOR_NAMES: &[&str] = &["at_least_one_of", "mutually_exclusive"];

#[derive(Debug, Clone)]
pub struct EnumSchema {
    pub name: String,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Schema {
    Record(RecordSchema),
    Enum(EnumSchema),
}

impl Schema {
    pub fn name(&self) -> &str {
        match self {
            Schema::Record(r) => &r.name,
            Schema::Enum(e) => &e.name,
        }
    }

    pub fn as_record(&self) -> Option<&RecordSchema> {
        match self {
            Schema::Record(r) => Some(r),
            Schema::Enum(_) => None,
        }
    }
}

/// A resolved schema, shared between the model registry and every
/// `ModelBlock`/`EntityBlock` that reference it.
#[derive(Debug, Clone)]
pub struct SchemaHandle(pub Arc<Schema>);

impl SchemaHandle {
    pub fn new(schema: Schema) -> Self {
        SchemaHandle(Arc::new(schema))
    }
}

impl std::ops::Deref for SchemaHandle {
    type Target = Schema;
    fn deref(&self) -> &Schema {
        &self.0
    }
}

/// A parse error in the schema grammar, always surfaced by the caller as
/// `E0221` (model execution/parse failure) or `E0233` (invalid schema
/// shape).
#[derive(Debug, Clone)]
pub struct SchemaParseError(pub String);

impl fmt::Display for SchemaParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SchemaParseError> for TypedownError {
    fn from(e: SchemaParseError) -> Self {
        TypedownError::Schema(e.0)
    }
}

/// Hand-written recursive-descent tokenizer/parser: the grammar is small
/// enough that a direct character-scan parser (no parser-combinator crate)
/// is the idiomatic choice, matching the rest of the pipeline's manual
/// accumulator-style parsing.
struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser {
            chars: src.chars().peekable(),
            pos: 0,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
        // Line comments: `# ...` to end of line.
        if self.peek() == Some('#') {
            while matches!(self.peek(), Some(c) if c != '\n') {
                self.bump();
            }
            self.skip_ws();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), SchemaParseError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(SchemaParseError(format!(
                "expected '{expected}' at position {}, found '{c}'",
                self.pos
            ))),
            None => Err(SchemaParseError(format!(
                "expected '{expected}' but reached end of input"
            ))),
        }
    }

    fn try_consume(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, SchemaParseError> {
        self.skip_ws();
        let mut s = String::new();
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            s.push(self.bump().unwrap());
        }
        if s.is_empty() {
            return Err(SchemaParseError(format!(
                "expected identifier at position {}",
                self.pos
            )));
        }
        Ok(s)
    }

    fn string_literal(&mut self) -> Result<String, SchemaParseError> {
        self.skip_ws();
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => {
                    if let Some(escaped) = self.bump() {
                        s.push(escaped);
                    }
                }
                Some(c) => s.push(c),
                None => return Err(SchemaParseError("unterminated string literal".into())),
            }
        }
        Ok(s)
    }

    fn number_literal(&mut self) -> Result<String, SchemaParseError> {
        self.skip_ws();
        let mut s = String::new();
        if self.peek() == Some('-') {
            s.push(self.bump().unwrap());
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            s.push(self.bump().unwrap());
        }
        if s.is_empty() || s == "-" {
            return Err(SchemaParseError(format!(
                "expected number at position {}",
                self.pos
            )));
        }
        Ok(s)
    }

    fn type_expr(&mut self) -> Result<FieldType, SchemaParseError> {
        let name = self.ident()?;
        let ty = match name.as_str() {
            "str" => FieldType::Str,
            "int" => FieldType::Int,
            "float" => FieldType::Float,
            "bool" => FieldType::Bool,
            "any" => FieldType::Any,
            "list" => {
                self.expect('[')?;
                let inner = self.type_expr()?;
                self.expect(']')?;
                FieldType::List(Box::new(inner))
            }
            "map" => {
                self.expect('[')?;
                let inner = self.type_expr()?;
                self.expect(']')?;
                FieldType::Map(Box::new(inner))
            }
            "Ref" => {
                self.expect('[')?;
                let mut targets = vec![self.ident()?];
                while self.try_consume(',') {
                    targets.push(self.ident()?);
                }
                self.expect(']')?;
                FieldType::Ref(targets)
            }
            other => {
                return Err(SchemaParseError(format!(
                    "unknown field type '{other}'"
                )))
            }
        };
        Ok(ty)
    }

    fn default_literal(&mut self) -> Result<Value, SchemaParseError> {
        self.skip_ws();
        match self.peek() {
            Some('"') => Ok(Value::String(self.string_literal()?)),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let n = self.number_literal()?;
                n.parse::<i64>()
                    .map(|i| Value::Number(i.into()))
                    .or_else(|_| {
                        n.parse::<f64>()
                            .ok()
                            .and_then(serde_json::Number::from_f64)
                            .map(Value::Number)
                            .ok_or_else(|| SchemaParseError(format!("invalid numeric default '{n}'")))
                    })
            }
            Some(_) => {
                let ident = self.ident()?;
                match ident.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" => Ok(Value::Null),
                    other => Err(SchemaParseError(format!("invalid default literal '{other}'"))),
                }
            }
            None => Err(SchemaParseError("expected default literal".into())),
        }
    }

    fn field(&mut self) -> Result<FieldDescriptor, SchemaParseError> {
        let name = self.ident()?;
        self.expect(':')?;
        let ty = self.type_expr()?;
        self.skip_ws();
        let (required, default) = if self.try_consume('=') {
            (false, Some(self.default_literal()?))
        } else {
            (true, None)
        };
        Ok(FieldDescriptor {
            name,
            ty,
            required,
            default,
        })
    }

    fn validator_decl(&mut self) -> Result<(String, Validator), SchemaParseError> {
        // "@validate(" field_name "," string_literal ")"
        self.expect('(')?;
        let target = self.ident()?;
        self.expect(',')?;
        let spec = self.string_literal()?;
        self.expect(')')?;
        let (name, argument) = match spec.split_once(':') {
            Some((name, arg)) => (name.to_string(), Some(arg.to_string())),
            None => (spec, None),
        };
        Ok((target, Validator { name, argument }))
    }

    fn record_validator_decl(&mut self) -> Result<Validator, SchemaParseError> {
        self.expect('(')?;
        let spec = self.string_literal()?;
        self.expect(')')?;
        let (name, argument) = match spec.split_once(':') {
            Some((name, arg)) => (name.to_string(), Some(arg.to_string())),
            None => (spec, None),
        };
        Ok(Validator { name, argument })
    }

    fn record_schema(&mut self, name: String) -> Result<RecordSchema, SchemaParseError> {
        self.expect('{')?;
        let mut fields = Vec::new();
        self.skip_ws();
        if self.peek() != Some('}') {
            fields.push(self.field()?);
            while self.try_consume(',') {
                self.skip_ws();
                if self.peek() == Some('}') {
                    break;
                }
                fields.push(self.field()?);
            }
        }
        self.expect('}')?;

        let mut field_validators = Vec::new();
        let mut record_validators = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('@') {
                self.bump();
                let directive = self.ident()?;
                match directive.as_str() {
                    "validate" => field_validators.push(self.validator_decl()?),
                    "validate_record" => record_validators.push(self.record_validator_decl()?),
                    other => {
                        return Err(SchemaParseError(format!(
                            "unknown schema directive '@{other}'"
                        )))
                    }
                }
            } else {
                break;
            }
        }

        Ok(RecordSchema {
            name,
            fields,
            field_validators,
            record_validators,
        })
    }

    fn enum_schema(&mut self, name: String) -> Result<EnumSchema, SchemaParseError> {
        self.expect('{')?;
        let mut variants = vec![self.ident()?];
        while self.try_consume(',') {
            self.skip_ws();
            if self.peek() == Some('}') {
                break;
            }
            variants.push(self.ident()?);
        }
        self.expect('}')?;
        Ok(EnumSchema { name, variants })
    }

    fn schema(&mut self) -> Result<Schema, SchemaParseError> {
        let keyword = self.ident()?;
        let name = self.ident()?;
        match keyword.as_str() {
            "record" => Ok(Schema::Record(self.record_schema(name)?)),
            "enum" => Ok(Schema::Enum(self.enum_schema(name)?)),
            other => Err(SchemaParseError(format!(
                "expected 'record' or 'enum', found '{other}'"
            ))),
        }
    }
}

/// Parses a model block's body into a [`Schema`]. The resulting schema's
/// `name()` must equal `declared_name` (the linker reports a mismatch as
/// `E0231` otherwise; this function only reports grammar errors).
pub fn parse_schema(body: &str) -> Result<Schema, SchemaParseError> {
    let mut parser = Parser::new(body);
    let schema = parser.schema()?;
    parser.skip_ws();
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_record_with_ref_and_default() {
        let schema = parse_schema(
            r#"record User {
                name: str,
                email: str,
                age: int = 0,
                manager: Ref[User],
            }"#,
        )
        .unwrap();
        let record = schema.as_record().unwrap();
        assert_eq!(record.name, "User");
        assert_eq!(record.fields.len(), 4);
        assert!(record.field("age").unwrap().default.is_some());
        assert!(!record.field("age").unwrap().required);
        assert!(record.field("manager").unwrap().ty.is_reference());
    }

    #[test]
    fn parses_polymorphic_ref_and_list_of_ref() {
        let schema = parse_schema(
            "record Order { buyer: Ref[User, Organization], items: list[Ref[Product]] }",
        )
        .unwrap();
        let record = schema.as_record().unwrap();
        let buyer_targets = record.field("buyer").unwrap().ty.reference_targets().unwrap();
        assert_eq!(buyer_targets, ["User", "Organization"]);
        let items_targets = record.field("items").unwrap().ty.reference_targets().unwrap();
        assert_eq!(items_targets, ["Product"]);
    }

    #[test]
    fn parses_validators() {
        let schema = parse_schema(
            r#"record User {
                email: str,
            }
            @validate(email, "matches_regex:^[^@]+@[^@]+$")"#,
        )
        .unwrap();
        let record = schema.as_record().unwrap();
        assert_eq!(record.field_validators.len(), 1);
        assert_eq!(record.field_validators[0].0, "email");
        assert_eq!(record.field_validators[0].1.name, "matches_regex");
    }

    #[test]
    fn parses_enum() {
        let schema = parse_schema("enum Status { Draft, Published, Archived }").unwrap();
        match schema {
            Schema::Enum(e) => assert_eq!(e.variants, vec!["Draft", "Published", "Archived"]),
            Schema::Record(_) => panic!("expected enum"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse_schema("record Bad { x: weird }").unwrap_err();
        assert!(err.0.contains("unknown field type"));
    }

    #[test]
    fn reserved_id_field_is_detectable() {
        let schema = parse_schema("record Bad { id: str }").unwrap();
        assert!(schema.as_record().unwrap().has_reserved_id_field());
    }
}
