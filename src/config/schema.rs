//! Schema registry settings

use serde::Deserialize;

use crate::domain::schema::CompatibilityLevel;

/// Schema registry configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaConfig {
    /// Level applied when a registration does not name one
    #[serde(default)]
    pub default_compatibility: CompatibilityLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_compatibility_is_backward() {
        assert_eq!(
            SchemaConfig::default().default_compatibility,
            CompatibilityLevel::Backward
        );
    }

    #[test]
    fn test_level_deserializes_from_upper_case() {
        let config: SchemaConfig =
            serde_json::from_str(r#"{"default_compatibility": "FULL"}"#).unwrap();
        assert_eq!(config.default_compatibility, CompatibilityLevel::Full);
    }
}
