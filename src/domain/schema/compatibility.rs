//! Compatibility checks between consecutive schema versions.
//!
//! - BACKWARD: the new version can read data written with the previous one.
//!   Removing a required field, narrowing a type, dropping enum values, or
//!   making a nullable field non-null are rejected.
//! - FORWARD: the previous version can read data written with the new one.
//!   Adding a required field, making an optional field required, widening a
//!   type, or adding enum values are rejected.
//! - FULL: both directions.
//! - NONE: anything goes.

use super::definition::{join, CompatibilityLevel, FieldKind, FieldSchema, ObjectSchema};

#[derive(Debug, Clone, Copy)]
enum Direction {
    Backward,
    Forward,
}

/// Returns human-readable violations; empty means compatible.
pub fn check_compatibility(
    level: CompatibilityLevel,
    previous: &ObjectSchema,
    candidate: &ObjectSchema,
) -> Vec<String> {
    let mut violations = Vec::new();
    match level {
        CompatibilityLevel::None => {}
        CompatibilityLevel::Backward => backward(previous, candidate, "$", &mut violations),
        CompatibilityLevel::Forward => forward(previous, candidate, "$", &mut violations),
        CompatibilityLevel::Full => {
            backward(previous, candidate, "$", &mut violations);
            forward(previous, candidate, "$", &mut violations);
        }
    }
    violations
}

fn backward(old: &ObjectSchema, new: &ObjectSchema, path: &str, out: &mut Vec<String>) {
    for (name, old_field) in &old.properties {
        let field_path = join(path, name);
        match new.properties.get(name) {
            None if old.is_required(name) => {
                out.push(format!("required field '{}' was removed", field_path));
            }
            None => {}
            Some(new_field) => accepts(new_field, old_field, Direction::Backward, &field_path, out),
        }
    }
}

fn forward(old: &ObjectSchema, new: &ObjectSchema, path: &str, out: &mut Vec<String>) {
    for (name, new_field) in &new.properties {
        let field_path = join(path, name);
        if new.is_required(name) && !old.is_required(name) {
            if old.properties.contains_key(name) {
                out.push(format!("optional field '{}' became required", field_path));
            } else {
                out.push(format!("new required field '{}' was added", field_path));
            }
        }
        if let Some(old_field) = old.properties.get(name) {
            accepts(old_field, new_field, Direction::Forward, &field_path, out);
        }
    }
    for name in &old.required {
        if !new.properties.contains_key(name) {
            out.push(format!(
                "field '{}' is required by the previous version but was removed",
                join(path, name)
            ));
        }
    }
}

/// Whether a reader schema accepts every value a writer schema allows.
fn accepts(
    reader: &FieldSchema,
    writer: &FieldSchema,
    direction: Direction,
    path: &str,
    out: &mut Vec<String>,
) {
    if writer.nullable && !reader.nullable {
        out.push(match direction {
            Direction::Backward => format!("field '{}' is no longer nullable", path),
            Direction::Forward => format!("field '{}' became nullable", path),
        });
    }

    match (&reader.kind, &writer.kind) {
        (FieldKind::Any, _) => {}
        (FieldKind::Number, FieldKind::Integer) => {}
        (FieldKind::Object(r), FieldKind::Object(w)) => match direction {
            Direction::Backward => backward(w, r, path, out),
            Direction::Forward => forward(r, w, path, out),
        },
        (FieldKind::Array(r), FieldKind::Array(w)) => {
            accepts(r, w, direction, &format!("{}[]", path), out)
        }
        (r, w) if r.name() == w.name() => {}
        (r, w) => out.push(match direction {
            Direction::Backward => format!(
                "field '{}' type narrowed from {} to {}",
                path,
                w.name(),
                r.name()
            ),
            Direction::Forward => format!(
                "field '{}' type widened from {} to {}",
                path,
                r.name(),
                w.name()
            ),
        }),
    }

    if let Some(reader_values) = &reader.allowed {
        match &writer.allowed {
            Some(writer_values) => {
                for value in writer_values.iter().filter(|v| !reader_values.contains(v)) {
                    out.push(match direction {
                        Direction::Backward => {
                            format!("enum value {} was removed from field '{}'", value, path)
                        }
                        Direction::Forward => {
                            format!("enum value {} was added to field '{}'", value, path)
                        }
                    });
                }
            }
            None => out.push(match direction {
                Direction::Backward => format!("field '{}' gained an enum restriction", path),
                Direction::Forward => format!("field '{}' lost its enum restriction", path),
            }),
        }
    }
}
