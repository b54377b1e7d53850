//! Topic and registry configuration
//!
//! All values have defaults, so an empty JSON object is a valid config.
//! Invalid values are rejected by `validate()` at construction time.

use crate::error::{Result, SseError};
use serde::{Deserialize, Serialize};

fn default_mailbox_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    64
}

/// Per-topic channel sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    /// Events buffered per subscriber before further deliveries are dropped
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Pending register/deregister/publish commands per topic
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl TopicConfig {
    /// Check that both channels can be created
    pub fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 {
            return Err(SseError::Config(
                "mailboxCapacity must be greater than 0".to_string(),
            ));
        }
        if self.command_capacity == 0 {
            return Err(SseError::Config(
                "commandCapacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// When a registry drops topics that have no subscribers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalPolicy {
    /// Topics live until `remove`, `remove_if_empty` or `close_all`
    #[default]
    Explicit,
    /// Topics are removed as soon as their last subscriber leaves
    WhenEmpty,
}

/// Topic registry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Settings applied to every topic the registry creates
    #[serde(default)]
    pub topic: TopicConfig,

    /// Empty-topic garbage collection
    #[serde(default)]
    pub removal: RemovalPolicy,
}

impl RegistryConfig {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SseError::Config(format!("Failed to parse registry config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the nested topic settings
    pub fn validate(&self) -> Result<()> {
        self.topic.validate()
    }

    /// Builder-style removal policy override
    pub fn with_removal(mut self, removal: RemovalPolicy) -> Self {
        self.removal = removal;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_config_default() {
        let config = TopicConfig::default();
        assert_eq!(config.mailbox_capacity, 256);
        assert_eq!(config.command_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topic_config_rejects_zero_capacity() {
        let config = TopicConfig {
            mailbox_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SseError::Config(_))));

        let config = TopicConfig {
            command_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SseError::Config(_))));
    }

    #[test]
    fn test_registry_config_from_empty_json() {
        let config = RegistryConfig::from_json("{}").unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert_eq!(config.removal, RemovalPolicy::Explicit);
    }

    #[test]
    fn test_registry_config_from_json() {
        let config = RegistryConfig::from_json(
            r#"{"topic": {"mailboxCapacity": 16}, "removal": "whenEmpty"}"#,
        )
        .unwrap();
        assert_eq!(config.topic.mailbox_capacity, 16);
        assert_eq!(config.topic.command_capacity, 64);
        assert_eq!(config.removal, RemovalPolicy::WhenEmpty);
    }

    #[test]
    fn test_registry_config_from_json_invalid() {
        assert!(matches!(
            RegistryConfig::from_json("not json"),
            Err(SseError::Config(_))
        ));
        assert!(matches!(
            RegistryConfig::from_json(r#"{"topic": {"commandCapacity": 0}}"#),
            Err(SseError::Config(_))
        ));
    }

    #[test]
    fn test_registry_config_serialization() {
        let config = RegistryConfig::default().with_removal(RemovalPolicy::WhenEmpty);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"removal\":\"whenEmpty\""));
        assert!(json.contains("\"mailboxCapacity\":256"));
    }
}
