//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// What happens to children bound by a mandatory relation when their parent
/// is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalPolicy {
    /// Remove the dependent children together with the parent
    #[default]
    Cascade,
    /// Refuse to remove a parent that still has dependent children
    Reject,
}

impl FromStr for RemovalPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cascade" => Ok(RemovalPolicy::Cascade),
            "reject" => Ok(RemovalPolicy::Reject),
            other => Err(ConfigError::InvalidRemovalPolicy(other.to_string())),
        }
    }
}

/// Engine configuration, fixed for a whole snapshot lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Handling of children when a parent is removed
    pub removal_policy: RemovalPolicy,
    /// Reject a seal when two records own the same symbolic id
    pub unique_symbolic_ids: bool,
    /// Type-check declared fields on seal
    pub check_field_types: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            removal_policy: RemovalPolicy::Cascade,
            unique_symbolic_ids: true,
            check_field_types: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from a JSON document. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidJson(e.to_string()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let removal_policy = match lookup("ENTITY_STORE_REMOVAL_POLICY") {
            Some(value) => value.parse()?,
            None => defaults.removal_policy,
        };

        let unique_symbolic_ids = match lookup("ENTITY_STORE_UNIQUE_SYMBOLIC_IDS") {
            Some(value) => parse_flag("ENTITY_STORE_UNIQUE_SYMBOLIC_IDS", &value)?,
            None => defaults.unique_symbolic_ids,
        };

        let check_field_types = match lookup("ENTITY_STORE_CHECK_FIELD_TYPES") {
            Some(value) => parse_flag("ENTITY_STORE_CHECK_FIELD_TYPES", &value)?,
            None => defaults.check_field_types,
        };

        Ok(Self {
            removal_policy,
            unique_symbolic_ids,
            check_field_types,
        })
    }

    /// Builder-style setter for the removal policy.
    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid removal policy '{0}', expected 'cascade' or 'reject'")]
    InvalidRemovalPolicy(String),

    #[error("invalid boolean value '{value}' for {var}")]
    InvalidFlag { var: &'static str, value: String },

    #[error("invalid configuration JSON: {0}")]
    InvalidJson(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.removal_policy, RemovalPolicy::Cascade);
        assert!(config.unique_symbolic_ids);
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("ENTITY_STORE_REMOVAL_POLICY", "Reject"),
            ("ENTITY_STORE_UNIQUE_SYMBOLIC_IDS", "off"),
            ("ENTITY_STORE_CHECK_FIELD_TYPES", "0"),
        ]))
        .unwrap();

        assert_eq!(config.removal_policy, RemovalPolicy::Reject);
        assert!(!config.unique_symbolic_ids);
        assert!(!config.check_field_types);
    }

    #[test]
    fn rejects_bad_values() {
        let result =
            EngineConfig::from_lookup(lookup_from(&[("ENTITY_STORE_REMOVAL_POLICY", "orphan")]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidRemovalPolicy("orphan".into()))
        );

        let result =
            EngineConfig::from_lookup(lookup_from(&[("ENTITY_STORE_CHECK_FIELD_TYPES", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidFlag { value, .. }) if value == "maybe"));
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = EngineConfig::from_json(r#"{"removalPolicy": "reject"}"#).unwrap();
        assert_eq!(config.removal_policy, RemovalPolicy::Reject);
        assert!(config.check_field_types);

        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ConfigError::InvalidJson(_))
        ));
    }
}
