//! Structured-output schemas
//!
//! Schemas are plain data: serialisable, comparable, and declared next to
//! the prompt that requests them. A [`SchemaValidator`] maps raw model text
//! into a JSON value that conforms to the declared schema, or fails with
//! [`SubstrateError::Schema`] so the caller can retry or degrade.

use crate::SubstrateError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

/// Declared shape of a structured model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Schema name, used in prompts and error messages.
    pub name: String,
    /// Field name → expected shape. BTreeMap keeps serialised schemas
    /// byte-comparable.
    pub fields: BTreeMap<String, FieldSpec>,
}

impl OutputSchema {
    /// Create an empty schema with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                kind,
                required: true,
            },
        );
        self
    }

    /// Add an optional field.
    pub fn optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                kind,
                required: false,
            },
        );
        self
    }
}

/// Expected shape of a single schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// The field's value kind.
    pub kind: FieldKind,
    /// Whether the field must be present.
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Value kinds a schema field can declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FieldKind {
    /// Any string.
    String,
    /// A float; integers coerce.
    Number,
    /// An integer; floats with no fractional part coerce.
    Integer,
    /// A boolean.
    Boolean,
    /// One of a fixed set of lowercase variants. Matching is
    /// case-insensitive; the canonical lowercase form is written back.
    Enum {
        /// Allowed variants, lowercase.
        variants: Vec<String>,
    },
    /// An array of strings with an optional length cap.
    StringArray {
        /// Maximum number of elements, when bounded.
        #[serde(default)]
        max_len: Option<usize>,
    },
}

/// Validates raw model output against a declared schema.
pub trait SchemaValidator: Send + Sync {
    /// Parse `raw` and check it against `schema`. On success the returned
    /// value is a JSON object containing every declared field, coerced to
    /// its canonical representation.
    fn validate(&self, schema: &OutputSchema, raw: &str) -> Result<Value, SubstrateError>;
}

/// Default validator: strict field checking over a lenient JSON extraction.
///
/// Models wrap JSON in prose and code fences more often than not, so the
/// extraction pass finds the outermost `{...}` before parsing. Everything
/// after that point is strict: unknown kinds fail, required fields must be
/// present, enum variants must match.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictValidator;

/// Extract the first top-level JSON object from possibly noisy model text
/// (prose preambles, code fences).
pub fn extract_json_object(raw: &str) -> Result<Value, SubstrateError> {
    let trimmed = raw.trim();
    // Fast path: the whole payload is the object.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Ok(v);
        }
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| SubstrateError::Schema("no JSON object in output".into()))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| SubstrateError::Schema("unterminated JSON object".into()))?;
    if end <= start {
        return Err(SubstrateError::Schema("unterminated JSON object".into()));
    }
    serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| SubstrateError::Schema(format!("malformed JSON: {e}")))
}

impl StrictValidator {
    fn coerce_field(name: &str, spec: &FieldSpec, value: &Value) -> Result<Value, SubstrateError> {
        match &spec.kind {
            FieldKind::String => value
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| SubstrateError::Schema(format!("field '{name}' must be a string"))),
            FieldKind::Number => value
                .as_f64()
                .map(|n| serde_json::json!(n))
                .ok_or_else(|| SubstrateError::Schema(format!("field '{name}' must be a number"))),
            FieldKind::Integer => {
                if let Some(i) = value.as_i64() {
                    Ok(serde_json::json!(i))
                } else if let Some(f) = value.as_f64() {
                    if f.fract() == 0.0 {
                        Ok(serde_json::json!(f as i64))
                    } else {
                        Err(SubstrateError::Schema(format!(
                            "field '{name}' must be an integer, got {f}"
                        )))
                    }
                } else {
                    Err(SubstrateError::Schema(format!(
                        "field '{name}' must be an integer"
                    )))
                }
            }
            FieldKind::Boolean => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| SubstrateError::Schema(format!("field '{name}' must be a boolean"))),
            FieldKind::Enum { variants } => {
                let s = value.as_str().ok_or_else(|| {
                    SubstrateError::Schema(format!("field '{name}' must be a string enum"))
                })?;
                let lowered = s.trim().to_lowercase();
                if variants.iter().any(|v| v == &lowered) {
                    Ok(Value::String(lowered))
                } else {
                    Err(SubstrateError::Schema(format!(
                        "field '{name}': '{s}' is not one of {variants:?}"
                    )))
                }
            }
            FieldKind::StringArray { max_len } => {
                let arr = value.as_array().ok_or_else(|| {
                    SubstrateError::Schema(format!("field '{name}' must be an array"))
                })?;
                let mut out = Vec::with_capacity(arr.len());
                for item in arr {
                    let s = item.as_str().ok_or_else(|| {
                        SubstrateError::Schema(format!("field '{name}' must contain strings"))
                    })?;
                    out.push(Value::String(s.to_string()));
                }
                if let Some(cap) = max_len {
                    out.truncate(*cap);
                }
                Ok(Value::Array(out))
            }
        }
    }
}

impl SchemaValidator for StrictValidator {
    fn validate(&self, schema: &OutputSchema, raw: &str) -> Result<Value, SubstrateError> {
        let parsed = extract_json_object(raw)?;
        let obj = parsed
            .as_object()
            .ok_or_else(|| SubstrateError::Schema("output is not a JSON object".into()))?;

        let mut out = serde_json::Map::new();
        for (name, spec) in &schema.fields {
            match obj.get(name) {
                Some(Value::Null) | None => {
                    if spec.required {
                        return Err(SubstrateError::Schema(format!(
                            "schema '{}': missing required field '{name}'",
                            schema.name
                        )));
                    }
                }
                Some(value) => {
                    out.insert(name.clone(), Self::coerce_field(name, spec, value)?);
                }
            }
        }
        Ok(Value::Object(out))
    }
}
