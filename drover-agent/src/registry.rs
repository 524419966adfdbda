// ABOUTME: Registry pattern for runtime provider selection.
// ABOUTME: Factories build providers by type; configured instances are looked up by name.

use crate::config::ProvidersConfig;
use crate::provider::AgentProvider;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory that builds a named provider from its config section
pub type ProviderFactory = Box<dyn Fn(&str, &Value) -> Result<AgentProvider> + Send + Sync>;

/// Provider factories by type, plus the provider instances built from them
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
    providers: HashMap<String, Arc<AgentProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            providers: HashMap::new(),
        }
    }

    /// Register a provider factory by type
    pub fn register<F>(mut self, provider_type: &str, factory: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<AgentProvider> + Send + Sync + 'static,
    {
        self.factories
            .insert(provider_type.to_string(), Box::new(factory));
        self
    }

    /// Build a provider of the given type without registering it
    pub fn create(&self, provider_type: &str, name: &str, config: &Value) -> Result<AgentProvider> {
        let factory = self
            .factories
            .get(provider_type)
            .ok_or_else(|| anyhow!("Unknown provider type: {}", provider_type))?;
        factory(name, config)
    }

    /// Register a ready provider instance under its name
    pub fn insert(&mut self, provider: AgentProvider) {
        tracing::debug!(
            provider = %provider.name(),
            modes = ?provider.modes(),
            "Provider registered"
        );
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    /// Build and register every configured provider
    pub fn load(&mut self, config: &ProvidersConfig) -> Result<()> {
        for (name, section) in config {
            let provider = self
                .create(section.provider_type(), name, &section.to_json_value())
                .map_err(|e| anyhow!("Failed to build provider '{}': {}", name, e))?;
            self.insert(provider);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentProvider>> {
        self.providers.get(name).cloned()
    }

    /// Names of registered provider instances, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Provider types with a registered factory
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        use crate::providers::{cli, mock, server};

        Self::new()
            .register("cli", cli::factory())
            .register("server", server::factory())
            .register("mock", mock::factory())
    }
}
