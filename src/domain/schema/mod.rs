//! Schema module - versioned event contracts.
//!
//! A subject (usually the event type) owns a gapless sequence of schema
//! versions. New versions are admitted only if they satisfy the requested
//! compatibility level against the latest one.

mod compatibility;
mod definition;
mod registry;
mod validation;

pub use compatibility::check_compatibility;
pub use definition::{CompatibilityLevel, FieldKind, FieldSchema, ObjectSchema, SchemaDefinition};
pub use registry::{Registration, SchemaEntry, SchemaRegistry, VersionSelector};
pub use validation::{validate_payload, SchemaViolation};

use thiserror::Error;

/// Errors raised by schema parsing and registration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("subject '{0}' is not registered")]
    SubjectNotFound(String),

    #[error("subject '{subject}' has no version {version}")]
    VersionNotFound { subject: String, version: u32 },

    #[error("schema for '{subject}' is not {level} compatible: {}", .violations.join("; "))]
    Incompatible {
        subject: String,
        level: CompatibilityLevel,
        violations: Vec<String>,
    },
}
