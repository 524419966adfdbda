// ABOUTME: Tests for ProviderRegistry factories and config-driven loading.
// ABOUTME: Verifies built-in provider types and lookup of configured instances.

use drover_agent::config::parse_providers;
use drover_agent::{ProviderRegistry, SessionMode};
use serde_json::json;

#[test]
fn test_default_registry_has_builtin_types() {
    let registry = ProviderRegistry::default();
    let mut types = registry.available_types();
    types.sort_unstable();
    assert_eq!(types, vec!["cli", "mock", "server"]);
}

#[test]
fn test_unknown_type_errors() {
    let registry = ProviderRegistry::default();
    let err = registry.create("nonexistent", "x", &json!({})).unwrap_err();
    assert!(err.to_string().contains("Unknown provider type"));
}

#[test]
fn test_load_from_config() {
    let config = parse_providers(
        r#"
[providers.claude]
type = "cli"
binary = "claude"

[providers.opencode]
type = "server"
url = "http://127.0.0.1:4096"

[providers.fake]
type = "mock"
"#,
    )
    .unwrap();

    let mut registry = ProviderRegistry::default();
    registry.load(&config).unwrap();
    assert_eq!(registry.names(), vec!["claude", "fake", "opencode"]);

    let claude = registry.get("claude").unwrap();
    assert!(claude.supports(SessionMode::Interactive));
    let opencode = registry.get("opencode").unwrap();
    assert!(!opencode.supports(SessionMode::Interactive));
    assert!(registry.get("missing").is_none());
}

#[test]
fn test_load_reports_bad_section() {
    let config = parse_providers(
        r#"
[providers.broken]
type = "cli"
session_id_pattern = "("
"#,
    )
    .unwrap();
    let mut registry = ProviderRegistry::default();
    let err = registry.load(&config).unwrap_err();
    assert!(err.to_string().contains("broken"));
}

#[test]
fn test_custom_factory() {
    let registry = ProviderRegistry::new().register("custom", |name, _config| {
        Ok(drover_agent::AgentProvider::new(name))
    });
    let provider = registry.create("custom", "c1", &json!({})).unwrap();
    assert_eq!(provider.name(), "c1");
    assert!(provider.modes().is_empty());
}
