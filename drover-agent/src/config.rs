// ABOUTME: Provider configuration sections loaded from TOML.
// ABOUTME: Each [providers.<name>] table carries a `type` discriminator plus factory settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provider sections keyed by provider name
pub type ProvidersConfig = BTreeMap<String, ProviderConfig>;

/// One provider section with type discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider type: "cli", "server", "mock"
    #[serde(rename = "type")]
    pub provider_type: String,

    /// Remaining fields passed to the provider factory
    #[serde(flatten)]
    pub config: toml::Table,
}

impl ProviderConfig {
    pub fn new(provider_type: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            config: toml::Table::new(),
        }
    }

    /// Set a string field
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.config
            .insert(key.to_string(), toml::Value::String(value.into()));
        self
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    /// Convert config table to serde_json::Value for the registry
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: ProvidersConfig,
}

/// Parse the `[providers.*]` sections of a TOML document
pub fn parse_providers(content: &str) -> Result<ProvidersConfig> {
    let file: ProvidersFile = toml::from_str(content).context("Failed to parse provider TOML")?;
    Ok(file.providers)
}
