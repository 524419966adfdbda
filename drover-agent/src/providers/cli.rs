// ABOUTME: The `cli` provider type: one agent CLI binary exposed through both facets.
// ABOUTME: Headless runs it over stream-json pipes, interactive runs it inside a pty shell.

use super::pty::PtyProvider;
use super::stream_json::StreamJsonProvider;
use crate::provider::AgentProvider;
use crate::registry::ProviderFactory;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Flag that lets the agent run tools without interactive approval
pub const SAFETY_FLAG: &str = "--dangerously-skip-permissions";

/// Configuration for the agent CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to the agent binary
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Extra CLI arguments appended after the fixed flags
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Model override passed as --model
    #[serde(default)]
    pub model: Option<String>,
    /// Delay before the command line is typed into the pty shell
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Regex with one capture group matching the session id in terminal output
    #[serde(default)]
    pub session_id_pattern: Option<String>,
    /// Shell used for interactive sessions (defaults to $SHELL, then bash)
    #[serde(default)]
    pub shell: Option<String>,
    /// How long a headless --resume waits for the CLI to accept or reject the session id
    #[serde(default = "default_resume_check_ms")]
    pub resume_check_ms: u64,
}

fn default_binary() -> String {
    "claude".to_string()
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_resume_check_ms() -> u64 {
    2000
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            extra_args: Vec::new(),
            model: None,
            settle_delay_ms: default_settle_delay_ms(),
            session_id_pattern: None,
            shell: None,
            resume_check_ms: default_resume_check_ms(),
        }
    }
}

/// Build the composite provider for an agent CLI
pub fn cli_provider(name: &str, config: CliConfig) -> Result<AgentProvider> {
    let headless = Arc::new(StreamJsonProvider::new(name, config.clone()));
    let interactive = Arc::new(PtyProvider::new(name, config)?);
    Ok(AgentProvider::new(name)
        .with_headless(headless)
        .with_interactive(interactive))
}

/// Factory function for the registry
pub fn factory() -> ProviderFactory {
    Box::new(|name, config| {
        let cfg: CliConfig = serde_json::from_value(config.clone())?;
        cli_provider(name, cfg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SessionMode;
    use serde_json::json;

    #[test]
    fn test_factory_defaults() {
        let provider = factory()("claude", &json!({})).unwrap();
        assert_eq!(provider.name(), "claude");
        assert!(provider.supports(SessionMode::Headless));
        assert!(provider.supports(SessionMode::Interactive));
    }

    #[test]
    fn test_config_overrides() {
        let cfg: CliConfig = serde_json::from_value(json!({
            "binary": "/opt/agent/bin/claude",
            "extra_args": ["--verbose"],
            "settle_delay_ms": 50
        }))
        .unwrap();
        assert_eq!(cfg.binary, "/opt/agent/bin/claude");
        assert_eq!(cfg.extra_args, vec!["--verbose".to_string()]);
        assert_eq!(cfg.settle_delay_ms, 50);
        assert!(cfg.model.is_none());
    }

    #[test]
    fn test_invalid_session_pattern_rejected() {
        let result = factory()("claude", &json!({"session_id_pattern": "("}));
        assert!(result.is_err());
    }
}
