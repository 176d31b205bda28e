//! Schema definitions - a structural subset of JSON Schema.
//!
//! Supported keywords: `type` (object, string, integer, number, boolean,
//! array, or a `[T, "null"]` pair), `properties`, `required`,
//! `additionalProperties`, `items`, and `enum`. A missing `type` means any
//! value is accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::SchemaError;

/// Rule governing which changes are permitted between consecutive versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    None,
    #[default]
    Backward,
    Forward,
    Full,
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompatibilityLevel::None => "NONE",
            CompatibilityLevel::Backward => "BACKWARD",
            CompatibilityLevel::Forward => "FORWARD",
            CompatibilityLevel::Full => "FULL",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CompatibilityLevel {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(CompatibilityLevel::None),
            "BACKWARD" => Ok(CompatibilityLevel::Backward),
            "FORWARD" => Ok(CompatibilityLevel::Forward),
            "FULL" => Ok(CompatibilityLevel::Full),
            other => Err(SchemaError::InvalidSchema(format!(
                "unknown compatibility level '{}'",
                other
            ))),
        }
    }
}

/// The shape a field's values must have.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Any,
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<FieldSchema>),
    Object(ObjectSchema),
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Any => "any",
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array(_) => "array",
            FieldKind::Object(_) => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub kind: FieldKind,
    pub nullable: bool,
    /// Values allowed by an `enum` keyword.
    pub allowed: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, FieldSchema>,
    pub required: BTreeSet<String>,
    pub additional_properties: bool,
}

impl ObjectSchema {
    pub fn is_required(&self, field: &str) -> bool {
        self.required.contains(field)
    }
}

/// A parsed schema plus the JSON it was parsed from.
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    raw: Value,
    root: ObjectSchema,
}

impl SchemaDefinition {
    /// Parse a definition; the root must describe an object.
    pub fn parse(raw: Value) -> Result<Self, SchemaError> {
        let field = parse_field(&raw, "$")?;
        match field.kind {
            FieldKind::Object(root) if !field.nullable => Ok(Self { raw, root }),
            _ => Err(SchemaError::InvalidSchema(
                "root schema must be a non-nullable object".to_string(),
            )),
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn root(&self) -> &ObjectSchema {
        &self.root
    }

    /// Structural equality, ignoring formatting and unknown keywords.
    pub fn is_equivalent(&self, other: &SchemaDefinition) -> bool {
        self.root == other.root
    }
}

fn parse_field(value: &Value, path: &str) -> Result<FieldSchema, SchemaError> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(path, "schema must be a JSON object"))?;

    let (type_name, nullable) = parse_type(obj, path)?;
    let kind = match type_name.as_deref() {
        None if obj.contains_key("properties") => FieldKind::Object(parse_object(obj, path)?),
        None => FieldKind::Any,
        Some("object") => FieldKind::Object(parse_object(obj, path)?),
        Some("array") => {
            let items = match obj.get("items") {
                Some(items) => parse_field(items, &format!("{}[]", path))?,
                None => FieldSchema {
                    kind: FieldKind::Any,
                    nullable: true,
                    allowed: None,
                },
            };
            FieldKind::Array(Box::new(items))
        }
        Some("string") => FieldKind::String,
        Some("integer") => FieldKind::Integer,
        Some("number") => FieldKind::Number,
        Some("boolean") => FieldKind::Boolean,
        Some(other) => return Err(invalid(path, &format!("unsupported type '{}'", other))),
    };

    let allowed = match obj.get("enum") {
        None => None,
        Some(Value::Array(values)) if !values.is_empty() => Some(values.clone()),
        Some(_) => return Err(invalid(path, "enum must be a non-empty array")),
    };

    Ok(FieldSchema {
        kind,
        nullable,
        allowed,
    })
}

fn parse_type(obj: &Map<String, Value>, path: &str) -> Result<(Option<String>, bool), SchemaError> {
    match obj.get("type") {
        None => Ok((None, false)),
        Some(Value::String(name)) if name == "null" => Err(invalid(path, "a field cannot only be null")),
        Some(Value::String(name)) => Ok((Some(name.clone()), false)),
        Some(Value::Array(names)) => {
            let mut nullable = false;
            let mut concrete = Vec::new();
            for name in names {
                match name.as_str() {
                    Some("null") => nullable = true,
                    Some(other) => concrete.push(other.to_string()),
                    None => return Err(invalid(path, "type names must be strings")),
                }
            }
            match concrete.len() {
                1 => Ok((concrete.pop(), nullable)),
                _ => Err(invalid(path, "type arrays must name exactly one non-null type")),
            }
        }
        Some(_) => Err(invalid(path, "type must be a string or an array of strings")),
    }
}

fn parse_object(obj: &Map<String, Value>, path: &str) -> Result<ObjectSchema, SchemaError> {
    let mut properties = BTreeMap::new();
    if let Some(props) = obj.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| invalid(path, "properties must be an object"))?;
        for (name, field) in props {
            properties.insert(name.clone(), parse_field(field, &join(path, name))?);
        }
    }

    let mut required = BTreeSet::new();
    if let Some(names) = obj.get("required") {
        let names = names
            .as_array()
            .ok_or_else(|| invalid(path, "required must be an array"))?;
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| invalid(path, "required entries must be strings"))?;
            if !properties.contains_key(name) {
                return Err(invalid(
                    path,
                    &format!("required field '{}' is not declared in properties", name),
                ));
            }
            required.insert(name.to_string());
        }
    }

    let additional_properties = match obj.get("additionalProperties") {
        None => true,
        Some(Value::Bool(allowed)) => *allowed,
        Some(_) => return Err(invalid(path, "additionalProperties must be a boolean")),
    };

    Ok(ObjectSchema {
        properties,
        required,
        additional_properties,
    })
}

pub(crate) fn join(path: &str, field: &str) -> String {
    if path == "$" {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

fn invalid(path: &str, reason: &str) -> SchemaError {
    SchemaError::InvalidSchema(format!("{}: {}", path, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_with_required_fields() {
        let def = SchemaDefinition::parse(json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "amount": {"type": "number"},
                "note": {"type": ["string", "null"]}
            },
            "required": ["id", "amount"]
        }))
        .unwrap();

        let root = def.root();
        assert_eq!(root.properties.len(), 3);
        assert!(root.is_required("id"));
        assert!(!root.is_required("note"));
        assert!(root.properties["note"].nullable);
        assert!(root.additional_properties);
    }

    #[test]
    fn rejects_non_object_root() {
        let err = SchemaDefinition::parse(json!({"type": "string"})).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSchema(_)));
    }

    #[test]
    fn rejects_required_field_without_property() {
        let err = SchemaDefinition::parse(json!({
            "type": "object",
            "properties": {"id": {"type": "string"}},
            "required": ["id", "amount"]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("amount"));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = SchemaDefinition::parse(json!({
            "type": "object",
            "properties": {"when": {"type": "date"}}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("when"));
    }

    #[test]
    fn parses_nested_arrays_and_enums() {
        let def = SchemaDefinition::parse(json!({
            "type": "object",
            "properties": {
                "lines": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"sku": {"type": "string"}},
                        "required": ["sku"]
                    }
                },
                "currency": {"type": "string", "enum": ["EUR", "USD"]}
            }
        }))
        .unwrap();

        match &def.root().properties["lines"].kind {
            FieldKind::Array(items) => assert!(matches!(items.kind, FieldKind::Object(_))),
            other => panic!("expected array, got {:?}", other),
        }
        assert_eq!(
            def.root().properties["currency"].allowed,
            Some(vec![json!("EUR"), json!("USD")])
        );
    }

    #[test]
    fn equivalence_ignores_key_order_and_unknown_keywords() {
        let a = SchemaDefinition::parse(json!({
            "type": "object",
            "description": "v1",
            "properties": {"id": {"type": "string"}, "n": {"type": "integer"}},
            "required": ["id"]
        }))
        .unwrap();
        let b = SchemaDefinition::parse(json!({
            "required": ["id"],
            "properties": {"n": {"type": "integer"}, "id": {"type": "string"}},
            "type": "object"
        }))
        .unwrap();
        assert!(a.is_equivalent(&b));
    }

    #[test]
    fn compatibility_level_parses_case_insensitively() {
        assert_eq!("full".parse::<CompatibilityLevel>().unwrap(), CompatibilityLevel::Full);
        assert!("sideways".parse::<CompatibilityLevel>().is_err());
        assert_eq!(CompatibilityLevel::Backward.to_string(), "BACKWARD");
    }
}
