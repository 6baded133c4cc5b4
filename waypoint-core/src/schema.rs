//! Declarative shapes for structured data crossing step, memory and model
//! boundaries.
//!
//! A [`Schema`] is plain data (serde-serializable) so that resume contracts can
//! be persisted alongside suspended runs. Two entry points:
//! - [`Schema::validate`]: strict check; unknown object keys are stripped
//!   unless the object is declared `passthrough`.
//! - [`Schema::coerce`] / [`Schema::coerce_text`]: structured-output mode for
//!   model results: lossless scalar coercions, JSON extraction from free text,
//!   then validation.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum Schema {
    String,
    Number,
    Integer,
    Boolean,
    Null,
    Any,
    Enum(Vec<String>),
    Array(Box<Schema>),
    Object(ObjectSchema),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectSchema {
    pub fields: Vec<Field>,
    /// Keep keys that are not declared instead of stripping them.
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn required(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            optional: false,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            optional: true,
            ..Self::required(name, schema)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Validation failure with the JSON path of the offending value.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{path}: {kind}")]
pub struct ValidationError {
    pub path: String,
    pub kind: ValidationErrorKind,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationErrorKind {
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("'{value}' is not one of {allowed:?}")]
    NotInEnum { value: String, allowed: Vec<String> },

    #[error("expected an integer, found {0}")]
    NotAnInteger(f64),

    #[error("no JSON document found in model output")]
    NoJsonFound,

    #[error("no {0} schema declared")]
    Undeclared(&'static str),
}

impl ValidationError {
    /// A value was produced at a boundary that declares no schema for it.
    pub fn undeclared(what: &'static str) -> Self {
        Self::new(ROOT, ValidationErrorKind::Undeclared(what))
    }

    fn new(path: &str, kind: ValidationErrorKind) -> Self {
        Self {
            path: path.to_string(),
            kind,
        }
    }

    fn mismatch(path: &str, expected: &'static str, found: &Value) -> Self {
        Self::new(
            path,
            ValidationErrorKind::TypeMismatch {
                expected,
                found: type_name(found),
            },
        )
    }
}

const ROOT: &str = "$";

impl Schema {
    pub fn object(fields: impl IntoIterator<Item = Field>) -> Self {
        Schema::Object(ObjectSchema {
            fields: fields.into_iter().collect(),
            passthrough: false,
        })
    }

    pub fn passthrough_object(fields: impl IntoIterator<Item = Field>) -> Self {
        Schema::Object(ObjectSchema {
            fields: fields.into_iter().collect(),
            passthrough: true,
        })
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array(Box::new(items))
    }

    pub fn enumeration<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Schema::Enum(values.into_iter().map(Into::into).collect())
    }

    /// Strictly validate `value`, returning the normalized value.
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        self.check(value, ROOT, false)
    }

    /// Structured-output mode: coerce a model-produced value into this shape.
    pub fn coerce(&self, value: &Value) -> Result<Value, ValidationError> {
        self.check(value, ROOT, true)
    }

    /// Structured-output mode for raw model text. The text may be bare JSON,
    /// JSON inside a fenced code block, or prose wrapping a JSON document.
    /// A string schema accepts non-JSON text verbatim.
    pub fn coerce_text(&self, text: &str) -> Result<Value, ValidationError> {
        match extract_json(text) {
            Some(value) => self.coerce(&value),
            None if matches!(self, Schema::String | Schema::Any) => {
                Ok(Value::String(text.trim().to_string()))
            }
            None => Err(ValidationError::new(ROOT, ValidationErrorKind::NoJsonFound)),
        }
    }

    fn check(&self, value: &Value, path: &str, coerce: bool) -> Result<Value, ValidationError> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Null => match value {
                Value::Null => Ok(Value::Null),
                other => Err(ValidationError::mismatch(path, "null", other)),
            },
            Schema::String => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) if coerce => Ok(Value::String(n.to_string())),
                Value::Bool(b) if coerce => Ok(Value::String(b.to_string())),
                other => Err(ValidationError::mismatch(path, "string", other)),
            },
            Schema::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) if coerce => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| ValidationError::mismatch(path, "number", value)),
                other => Err(ValidationError::mismatch(path, "number", other)),
            },
            Schema::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::Number(n) => {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    // i64::MAX as f64 rounds up to 2^63, which is already out of range
                    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
                    if coerce && f.fract() == 0.0 && f.is_finite() && in_range {
                        Ok(Value::from(f as i64))
                    } else {
                        Err(ValidationError::new(path, ValidationErrorKind::NotAnInteger(f)))
                    }
                }
                Value::String(s) if coerce => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| ValidationError::mismatch(path, "integer", value)),
                other => Err(ValidationError::mismatch(path, "integer", other)),
            },
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if coerce => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(ValidationError::mismatch(path, "boolean", value)),
                },
                other => Err(ValidationError::mismatch(path, "boolean", other)),
            },
            Schema::Enum(allowed) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ValidationError::mismatch(path, "string", value))?;
                if allowed.iter().any(|a| a == s) {
                    return Ok(value.clone());
                }
                if coerce {
                    if let Some(hit) = allowed.iter().find(|a| a.eq_ignore_ascii_case(s.trim())) {
                        return Ok(Value::String(hit.clone()));
                    }
                }
                Err(ValidationError::new(
                    path,
                    ValidationErrorKind::NotInEnum {
                        value: s.to_string(),
                        allowed: allowed.clone(),
                    },
                ))
            }
            Schema::Array(items) => match value {
                Value::Array(values) => values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| items.check(v, &format!("{path}[{i}]"), coerce))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                Value::Null => Err(ValidationError::mismatch(path, "array", value)),
                single if coerce => Ok(Value::Array(vec![items.check(
                    single,
                    &format!("{path}[0]"),
                    coerce,
                )?])),
                other => Err(ValidationError::mismatch(path, "array", other)),
            },
            Schema::Object(object) => object.check(value, path, coerce),
        }
    }

    /// JSON-Schema-like description handed to models as an output contract.
    pub fn describe(&self) -> Value {
        match self {
            Schema::String => serde_json::json!({"type": "string"}),
            Schema::Number => serde_json::json!({"type": "number"}),
            Schema::Integer => serde_json::json!({"type": "integer"}),
            Schema::Boolean => serde_json::json!({"type": "boolean"}),
            Schema::Null => serde_json::json!({"type": "null"}),
            Schema::Any => serde_json::json!({}),
            Schema::Enum(values) => serde_json::json!({"type": "string", "enum": values}),
            Schema::Array(items) => serde_json::json!({"type": "array", "items": items.describe()}),
            Schema::Object(object) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in &object.fields {
                    let mut described = field.schema.describe();
                    if let (Some(desc), Some(obj)) = (&field.description, described.as_object_mut())
                    {
                        obj.insert("description".to_string(), Value::String(desc.clone()));
                    }
                    properties.insert(field.name.clone(), described);
                    if !field.optional {
                        required.push(Value::String(field.name.clone()));
                    }
                }
                serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": object.passthrough,
                })
            }
        }
    }
}

impl ObjectSchema {
    fn check(&self, value: &Value, path: &str, coerce: bool) -> Result<Value, ValidationError> {
        let map = value
            .as_object()
            .ok_or_else(|| ValidationError::mismatch(path, "object", value))?;

        let mut out = if self.passthrough {
            map.clone()
        } else {
            Map::new()
        };

        for field in &self.fields {
            let child = format!("{path}.{}", field.name);
            match map.get(&field.name) {
                None | Some(Value::Null) if field.optional => {
                    out.remove(&field.name);
                }
                None => {
                    return Err(ValidationError::new(
                        path,
                        ValidationErrorKind::MissingField(field.name.clone()),
                    ))
                }
                Some(v) => {
                    let checked = field.schema.check(v, &child, coerce)?;
                    out.insert(field.name.clone(), checked);
                }
            }
        }

        Ok(Value::Object(out))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex"))
}

/// Pull the first JSON document out of free-form model text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    for caps in fenced_block().captures_iter(trimmed) {
        if let Some(body) = caps.get(1) {
            if let Ok(v) = serde_json::from_str::<Value>(body.as_str().trim()) {
                return Some(v);
            }
        }
    }

    // Prose around a document: take the widest {...} or [...] span.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> Schema {
        Schema::object([
            Field::required("name", Schema::String),
            Field::optional("age", Schema::Integer),
            Field::optional(
                "preferences",
                Schema::object([Field::optional("travel", Schema::String)]),
            ),
            Field::required("tags", Schema::array(Schema::String)),
        ])
    }

    #[test]
    fn test_validate_accepts_nested_shape() {
        let value = json!({
            "name": "Sam",
            "preferences": {"travel": "trains"},
            "tags": ["a", "b"]
        });
        let out = profile().validate(&value).unwrap();
        assert_eq!(out["preferences"]["travel"], "trains");
        assert!(out.get("age").is_none());
    }

    #[test]
    fn test_validate_reports_path_of_nested_error() {
        let value = json!({"name": "Sam", "tags": ["a", 3]});
        let err = profile().validate(&value).unwrap_err();
        assert_eq!(err.path, "$.tags[1]");
        assert!(matches!(
            err.kind,
            ValidationErrorKind::TypeMismatch {
                expected: "string",
                found: "number"
            }
        ));
    }

    #[test]
    fn test_validate_missing_required_field() {
        let err = profile().validate(&json!({"tags": []})).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MissingField("name".into()));
        assert_eq!(err.path, "$");
    }

    #[test]
    fn test_validate_strips_unknown_keys_unless_passthrough() {
        let strict = Schema::object([Field::required("a", Schema::Number)]);
        let out = strict.validate(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(out, json!({"a": 1}));

        let loose = Schema::passthrough_object([Field::required("a", Schema::Number)]);
        let out = loose.validate(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_validate_is_strict_about_scalars() {
        assert!(Schema::Number.validate(&json!("5")).is_err());
        assert!(Schema::Integer.validate(&json!(1.5)).is_err());
        assert!(Schema::Boolean.validate(&json!("true")).is_err());
    }

    #[test]
    fn test_coerce_converts_lossless_scalars() {
        let schema = Schema::object([
            Field::required("days", Schema::Integer),
            Field::required("budget", Schema::Number),
            Field::required("flexible", Schema::Boolean),
            Field::required("cities", Schema::array(Schema::String)),
        ]);
        let out = schema
            .coerce(&json!({"days": "5", "budget": "1200.5", "flexible": "TRUE", "cities": "Tokyo"}))
            .unwrap();
        assert_eq!(out, json!({"days": 5, "budget": 1200.5, "flexible": true, "cities": ["Tokyo"]}));
    }

    #[test]
    fn test_coerce_integral_float_only_within_i64() {
        assert_eq!(Schema::Integer.coerce(&json!(7.0)).unwrap(), json!(7));
        assert_eq!(Schema::Integer.coerce(&json!(-9.0e15)).unwrap(), json!(-9_000_000_000_000_000i64));
        assert!(Schema::Integer.coerce(&json!(1.0e19)).is_err());
        assert!(Schema::Integer.coerce(&json!(9.223372036854775807e18)).is_err());
        assert!(Schema::Integer.coerce(&json!(-1.0e19)).is_err());
    }

    #[test]
    fn test_coerce_text_reads_fenced_json() {
        let schema = Schema::object([Field::required("suggestions", Schema::array(Schema::String))]);
        let text = "Here you go:\n```json\n{\"suggestions\": [\"Tokyo\", \"Kyoto\"]}\n```\nEnjoy!";
        let out = schema.coerce_text(text).unwrap();
        assert_eq!(out["suggestions"][1], "Kyoto");
    }

    #[test]
    fn test_coerce_text_reads_json_inside_prose() {
        let schema = Schema::object([Field::required("ok", Schema::Boolean)]);
        let out = schema.coerce_text("Result: {\"ok\": true} as requested").unwrap();
        assert_eq!(out, json!({"ok": true}));
    }

    #[test]
    fn test_coerce_text_without_json_fails_for_objects() {
        let schema = Schema::object([Field::required("ok", Schema::Boolean)]);
        let err = schema.coerce_text("I could not decide").unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::NoJsonFound);
    }

    #[test]
    fn test_coerce_text_accepts_plain_text_for_string_schema() {
        let out = Schema::String.coerce_text("  a plan  ").unwrap();
        assert_eq!(out, json!("a plan"));
    }

    #[test]
    fn test_enum_coercion_is_case_insensitive() {
        let schema = Schema::enumeration(["low", "high"]);
        assert!(schema.validate(&json!("HIGH")).is_err());
        assert_eq!(schema.coerce(&json!("HIGH")).unwrap(), json!("high"));
    }

    #[test]
    fn test_schema_survives_serde() {
        let schema = profile();
        let encoded = serde_json::to_string(&schema).unwrap();
        let decoded: Schema = serde_json::from_str(&encoded).unwrap();
        assert_eq!(schema, decoded);
    }

    #[test]
    fn test_describe_lists_required_fields() {
        let described = profile().describe();
        assert_eq!(described["type"], "object");
        assert_eq!(described["required"], json!(["name", "tags"]));
        assert_eq!(described["properties"]["tags"]["items"]["type"], "string");
    }
}
