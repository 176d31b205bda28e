//! In-process schema registry.
//!
//! Readers load an immutable snapshot without locking. Registrations take a
//! single writer lock, build a new snapshot from the current one, and swap it
//! in, so a reader never observes a half-registered version.

use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::domain::foundation::Timestamp;

use super::compatibility::check_compatibility;
use super::definition::{CompatibilityLevel, SchemaDefinition};
use super::validation::{validate_payload, SchemaViolation};
use super::SchemaError;

/// One immutable version of a subject's schema.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub subject: String,
    pub version: u32,
    pub definition: SchemaDefinition,
    pub compatibility: CompatibilityLevel,
    pub registered_at: Timestamp,
}

impl SchemaEntry {
    /// The JSON definition as registered.
    pub fn schema(&self) -> &Value {
        self.definition.raw()
    }
}

/// Outcome of a registration attempt that passed compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub version: u32,
    /// False when the definition matched the latest version and nothing was stored.
    pub registered: bool,
}

/// Which version of a subject to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    #[default]
    Latest,
    Exact(u32),
}

impl From<Option<u32>> for VersionSelector {
    fn from(version: Option<u32>) -> Self {
        version.map_or(VersionSelector::Latest, VersionSelector::Exact)
    }
}

#[derive(Debug, Clone, Default)]
struct RegistrySnapshot {
    subjects: BTreeMap<String, Vec<Arc<SchemaEntry>>>,
}

impl RegistrySnapshot {
    fn latest(&self, subject: &str) -> Option<&Arc<SchemaEntry>> {
        self.subjects.get(subject).and_then(|versions| versions.last())
    }

    fn select(&self, subject: &str, selector: VersionSelector) -> Result<Arc<SchemaEntry>, SchemaError> {
        let versions = self
            .subjects
            .get(subject)
            .ok_or_else(|| SchemaError::SubjectNotFound(subject.to_string()))?;
        let entry = match selector {
            VersionSelector::Latest => versions.last(),
            // Versions are gapless from 1.
            VersionSelector::Exact(version) => version
                .checked_sub(1)
                .and_then(|index| versions.get(index as usize)),
        };
        entry.cloned().ok_or_else(|| SchemaError::VersionNotFound {
            subject: subject.to_string(),
            version: match selector {
                VersionSelector::Latest => 0,
                VersionSelector::Exact(v) => v,
            },
        })
    }
}

/// Versioned schema storage with compatibility enforcement.
pub struct SchemaRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
    default_compatibility: CompatibilityLevel,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("subjects", &self.snapshot.load().subjects.len())
            .field("default_compatibility", &self.default_compatibility)
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writer: Mutex::new(()),
            default_compatibility: CompatibilityLevel::default(),
        }
    }

    pub fn with_default_compatibility(mut self, level: CompatibilityLevel) -> Self {
        self.default_compatibility = level;
        self
    }

    pub fn default_compatibility(&self) -> CompatibilityLevel {
        self.default_compatibility
    }

    /// Register a new version of `subject`.
    ///
    /// The definition is checked against the latest version under `level`.
    /// A definition structurally identical to the latest returns that
    /// version with `registered: false`.
    pub fn register_schema(
        &self,
        subject: &str,
        schema: Value,
        level: CompatibilityLevel,
    ) -> Result<Registration, SchemaError> {
        validate_subject(subject)?;
        let definition = SchemaDefinition::parse(schema)?;

        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.snapshot.load_full();

        let next_version = match current.latest(subject) {
            Some(latest) if latest.definition.is_equivalent(&definition) => {
                tracing::debug!(subject, version = latest.version, "Schema unchanged, not registering");
                return Ok(Registration {
                    version: latest.version,
                    registered: false,
                });
            }
            Some(latest) => {
                let violations =
                    check_compatibility(level, latest.definition.root(), definition.root());
                if !violations.is_empty() {
                    tracing::warn!(
                        subject,
                        level = %level,
                        latest = latest.version,
                        violations = violations.len(),
                        "Schema rejected as incompatible"
                    );
                    return Err(SchemaError::Incompatible {
                        subject: subject.to_string(),
                        level,
                        violations,
                    });
                }
                latest.version + 1
            }
            None => 1,
        };

        let entry = Arc::new(SchemaEntry {
            subject: subject.to_string(),
            version: next_version,
            definition,
            compatibility: level,
            registered_at: Timestamp::now(),
        });

        let mut next = RegistrySnapshot::clone(&current);
        next.subjects.entry(subject.to_string()).or_default().push(entry);
        self.snapshot.store(Arc::new(next));

        tracing::info!(subject, version = next_version, level = %level, "Schema registered");
        Ok(Registration {
            version: next_version,
            registered: true,
        })
    }

    /// Register using the registry's default compatibility level.
    pub fn register_schema_default(&self, subject: &str, schema: Value) -> Result<Registration, SchemaError> {
        self.register_schema(subject, schema, self.default_compatibility)
    }

    /// Dry-run a registration and return the violations it would raise.
    pub fn check_compatibility(
        &self,
        subject: &str,
        schema: Value,
        level: CompatibilityLevel,
    ) -> Result<Vec<String>, SchemaError> {
        let definition = SchemaDefinition::parse(schema)?;
        let snapshot = self.snapshot.load();
        Ok(match snapshot.latest(subject) {
            Some(latest) => check_compatibility(level, latest.definition.root(), definition.root()),
            None => Vec::new(),
        })
    }

    /// Validate a payload against a stored version.
    pub fn validate_event(
        &self,
        subject: &str,
        version: VersionSelector,
        data: &Value,
    ) -> Result<Vec<SchemaViolation>, SchemaError> {
        let entry = self.snapshot.load().select(subject, version)?;
        Ok(validate_payload(entry.definition.root(), data))
    }

    pub fn get_schema(&self, subject: &str, version: VersionSelector) -> Result<Arc<SchemaEntry>, SchemaError> {
        self.snapshot.load().select(subject, version)
    }

    pub fn list_versions(&self, subject: &str) -> Result<Vec<u32>, SchemaError> {
        self.snapshot
            .load()
            .subjects
            .get(subject)
            .map(|versions| versions.iter().map(|e| e.version).collect())
            .ok_or_else(|| SchemaError::SubjectNotFound(subject.to_string()))
    }

    pub fn list_subjects(&self) -> Vec<String> {
        self.snapshot.load().subjects.keys().cloned().collect()
    }

    pub fn latest_version(&self, subject: &str) -> Option<u32> {
        self.snapshot.load().latest(subject).map(|e| e.version)
    }

    pub fn has_subject(&self, subject: &str) -> bool {
        self.snapshot.load().subjects.contains_key(subject)
    }
}

fn validate_subject(subject: &str) -> Result<(), SchemaError> {
    if subject.trim().is_empty() {
        return Err(SchemaError::InvalidSchema("subject must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn invoice_v1() -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "amount": {"type": "number"}
            },
            "required": ["id", "amount"]
        })
    }

    #[test]
    fn first_registration_is_version_one() {
        let registry = SchemaRegistry::new();
        let reg = registry
            .register_schema("invoice", invoice_v1(), CompatibilityLevel::Backward)
            .unwrap();
        assert_eq!(reg, Registration { version: 1, registered: true });
        assert_eq!(registry.latest_version("invoice"), Some(1));
    }

    #[test]
    fn identical_definition_is_not_registered_twice() {
        let registry = SchemaRegistry::new();
        registry.register_schema_default("invoice", invoice_v1()).unwrap();
        let again = registry.register_schema_default("invoice", invoice_v1()).unwrap();
        assert_eq!(again, Registration { version: 1, registered: false });
        assert_eq!(registry.list_versions("invoice").unwrap(), vec![1]);
    }

    #[test]
    fn incompatible_registration_leaves_state_unchanged() {
        let registry = SchemaRegistry::new();
        registry.register_schema_default("invoice", invoice_v1()).unwrap();

        let err = registry
            .register_schema(
                "invoice",
                json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]}),
                CompatibilityLevel::Backward,
            )
            .unwrap_err();

        assert!(matches!(err, SchemaError::Incompatible { ref subject, .. } if subject == "invoice"));
        assert_eq!(registry.list_versions("invoice").unwrap(), vec![1]);
    }

    #[test]
    fn get_schema_selects_exact_and_latest() {
        let registry = SchemaRegistry::new();
        registry.register_schema_default("invoice", invoice_v1()).unwrap();
        let mut v2 = invoice_v1();
        v2["properties"]["currency"] = json!({"type": "string"});
        registry.register_schema_default("invoice", v2.clone()).unwrap();

        assert_eq!(registry.get_schema("invoice", VersionSelector::Exact(1)).unwrap().version, 1);
        let latest = registry.get_schema("invoice", VersionSelector::Latest).unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.schema(), &v2);
        assert!(matches!(
            registry.get_schema("invoice", VersionSelector::Exact(3)),
            Err(SchemaError::VersionNotFound { version: 3, .. })
        ));
        assert!(matches!(
            registry.get_schema("invoice", VersionSelector::Exact(0)),
            Err(SchemaError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn validate_event_reports_violations_without_mutating() {
        let registry = SchemaRegistry::new();
        registry.register_schema_default("invoice", invoice_v1()).unwrap();

        let ok = registry
            .validate_event("invoice", VersionSelector::Latest, &json!({"id": "inv_1", "amount": 100}))
            .unwrap();
        assert!(ok.is_empty());

        let bad = registry
            .validate_event("invoice", VersionSelector::Latest, &json!({"id": "inv_1"}))
            .unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(registry.list_versions("invoice").unwrap(), vec![1]);
    }

    #[test]
    fn unknown_subject_is_reported() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.validate_event("nope", VersionSelector::Latest, &json!({})),
            Err(SchemaError::SubjectNotFound(_))
        ));
        assert!(registry.list_versions("nope").is_err());
        assert_eq!(registry.latest_version("nope"), None);
    }

    #[test]
    fn check_compatibility_is_a_dry_run() {
        let registry = SchemaRegistry::new();
        registry.register_schema_default("invoice", invoice_v1()).unwrap();
        let violations = registry
            .check_compatibility(
                "invoice",
                json!({"type": "object", "properties": {"id": {"type": "string"}}}),
                CompatibilityLevel::Backward,
            )
            .unwrap();
        assert!(!violations.is_empty());
        assert_eq!(registry.latest_version("invoice"), Some(1));
    }

    #[test]
    fn empty_subject_is_rejected() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.register_schema_default("  ", invoice_v1()),
            Err(SchemaError::InvalidSchema(_))
        ));
    }

    #[test]
    fn concurrent_registrations_produce_gapless_versions() {
        let registry = Arc::new(SchemaRegistry::new().with_default_compatibility(CompatibilityLevel::None));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut properties = serde_json::Map::new();
                    properties.insert(format!("field_{}", i), json!({"type": "string"}));
                    let schema = json!({"type": "object", "properties": properties});
                    registry.register_schema_default("events", schema).unwrap()
                })
            })
            .collect();

        let mut versions: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap().version).collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());
        assert_eq!(registry.list_versions("events").unwrap(), (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn subjects_are_listed_in_order() {
        let registry = SchemaRegistry::new();
        registry.register_schema_default("payment", invoice_v1()).unwrap();
        registry.register_schema_default("invoice", invoice_v1()).unwrap();
        assert_eq!(registry.list_subjects(), vec!["invoice".to_string(), "payment".to_string()]);
        assert!(registry.has_subject("payment"));
    }
}
