use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use remap_core::EntityKind;

use crate::error::EngineError;

/// Per entity kind settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindConfig {
    /// Records of this kind always live at the top-level location.
    pub root_level: bool,
    /// Location for new records when the payload names none.
    pub default_location: Option<i64>,
    /// Fields whose values are remote ids of other records.
    pub relation_fields: Vec<String>,
}

impl KindConfig {
    pub fn root_level() -> Self {
        Self {
            root_level: true,
            ..Default::default()
        }
    }

    pub fn with_default_location(mut self, location: i64) -> Self {
        self.default_location = Some(location);
        self
    }

    pub fn with_relations(mut self, fields: &[&str]) -> Self {
        self.relation_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }
}

/// Configuration for the record-operation engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fallback location for new records of kinds without their own default.
    pub default_location: Option<i64>,
    /// Payload field naming the parent location, by remote id or native id.
    pub location_field: String,
    /// Skip the write when an update carries the same payload as last time.
    pub skip_unchanged: bool,
    /// Turn reference-index upkeep off during batches and rebuild once after.
    pub suppress_reference_index_in_batches: bool,
    pub kinds: BTreeMap<String, KindConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_location: None,
            location_field: "pid".into(),
            skip_unchanged: true,
            suppress_reference_index_in_batches: true,
            kinds: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_kind(mut self, kind: &str, config: KindConfig) -> Self {
        self.kinds.insert(kind.to_string(), config);
        self
    }

    pub fn kind(&self, kind: &EntityKind) -> Option<&KindConfig> {
        self.kinds.get(kind.as_str())
    }

    pub fn is_root_level(&self, kind: &EntityKind) -> bool {
        self.kind(kind).is_some_and(|k| k.root_level)
    }

    pub fn relation_fields(&self, kind: &EntityKind) -> &[String] {
        self.kind(kind)
            .map(|k| k.relation_fields.as_slice())
            .unwrap_or(&[])
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.location_field.trim().is_empty() {
            return Err(EngineError::Config("location_field must not be blank".into()));
        }
        if let Some(location) = self.default_location
            && location < 0
        {
            return Err(EngineError::Config(format!(
                "default_location must not be negative, got {location}"
            )));
        }
        for (name, kind) in &self.kinds {
            if let Some(location) = kind.default_location
                && location < 0
            {
                return Err(EngineError::Config(format!(
                    "kinds.{name}.default_location must not be negative, got {location}"
                )));
            }
            if kind.relation_fields.iter().any(|f| f == &self.location_field) {
                return Err(EngineError::Config(format!(
                    "kinds.{name}: `{}` is the location field and cannot be a relation",
                    self.location_field
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.location_field, "pid");
        assert!(config.skip_unchanged);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            default_location = 12
            skip_unchanged = false

            [kinds.pages]
            root_level = true

            [kinds.content]
            default_location = 4
            relation_fields = ["author", "categories"]
            "#,
        )
        .unwrap();

        let pages = EntityKind::parse("pages").unwrap();
        let content = EntityKind::parse("content").unwrap();
        assert_eq!(config.default_location, Some(12));
        assert!(!config.skip_unchanged);
        assert_eq!(config.location_field, "pid");
        assert!(config.is_root_level(&pages));
        assert!(!config.is_root_level(&content));
        assert_eq!(config.relation_fields(&content), ["author", "categories"]);
        assert!(config.relation_fields(&pages).is_empty());
    }

    #[test]
    fn rejects_negative_locations() {
        let err = EngineConfig::from_toml_str("default_location = -1").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let config = EngineConfig::default()
            .with_kind("pages", KindConfig::default().with_default_location(-5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn location_field_cannot_be_relation() {
        let config =
            EngineConfig::default().with_kind("content", KindConfig::default().with_relations(&["pid"]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("kinds = 3"),
            Err(EngineError::Config(_))
        ));
    }
}
