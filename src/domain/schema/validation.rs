//! Payload validation against a parsed schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::definition::{join, FieldKind, FieldSchema, ObjectSchema};

/// A single way in which a payload fails its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Dotted path to the offending value; `$` is the payload root.
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a payload; an empty result means it conforms.
pub fn validate_payload(schema: &ObjectSchema, data: &Value) -> Vec<SchemaViolation> {
    let mut violations = Vec::new();
    match data {
        Value::Object(_) => validate_object(schema, data, "$", &mut violations),
        other => violations.push(SchemaViolation::new(
            "$",
            format!("expected object, found {}", json_type(other)),
        )),
    }
    violations
}

fn validate_object(schema: &ObjectSchema, data: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    let Some(fields) = data.as_object() else {
        return;
    };

    for name in &schema.required {
        if !fields.contains_key(name) {
            out.push(SchemaViolation::new(&join(path, name), "required field is missing"));
        }
    }

    for (name, value) in fields {
        let field_path = join(path, name);
        match schema.properties.get(name) {
            Some(field) => validate_field(field, value, &field_path, out),
            None if !schema.additional_properties => {
                out.push(SchemaViolation::new(&field_path, "field is not allowed"));
            }
            None => {}
        }
    }
}

fn validate_field(field: &FieldSchema, value: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    if value.is_null() {
        if !field.nullable && !matches!(field.kind, FieldKind::Any) {
            out.push(SchemaViolation::new(path, "null is not allowed"));
        }
        return;
    }

    let type_ok = match (&field.kind, value) {
        (FieldKind::Any, _) => true,
        (FieldKind::String, Value::String(_)) => true,
        (FieldKind::Boolean, Value::Bool(_)) => true,
        (FieldKind::Number, Value::Number(_)) => true,
        (FieldKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (FieldKind::Object(inner), Value::Object(_)) => {
            validate_object(inner, value, path, out);
            true
        }
        (FieldKind::Array(items), Value::Array(values)) => {
            for (index, item) in values.iter().enumerate() {
                validate_field(items, item, &format!("{}[{}]", path, index), out);
            }
            true
        }
        _ => false,
    };

    if !type_ok {
        out.push(SchemaViolation::new(
            path,
            format!("expected {}, found {}", field.kind.name(), json_type(value)),
        ));
        return;
    }

    if let Some(allowed) = &field.allowed {
        if !allowed.contains(value) {
            out.push(SchemaViolation::new(path, format!("value {} is not one of the allowed values", value)));
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
