// ABOUTME: Configuration parsing from drover.toml with environment variable overrides
// ABOUTME: Provider sections pass through to the provider registry unchanged
use crate::paths;
use anyhow::{Context, Result};
use drover_agent::config::{ProviderConfig, ProvidersConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding the sqlite database and logs
    #[serde(default = "default_workspace_path")]
    pub path: String,
    /// Provider given to agents registered without one
    #[serde(default = "default_provider")]
    pub default_provider: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
            default_provider: default_provider(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Sender recorded on dispatch notifications
    #[serde(default = "default_dispatcher")]
    pub default_dispatcher: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_dispatcher: default_dispatcher(),
        }
    }
}

fn default_workspace_path() -> String {
    "~/.drover".to_string()
}

fn default_provider() -> String {
    "cli".to_string()
}

fn default_dispatcher() -> String {
    "system".to_string()
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(path = %path, "Failed to expand tilde: could not determine home directory");
    } else if path == "~" {
        return paths::home_dir().to_string_lossy().to_string();
    }
    path.to_string()
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. DROVER_CONFIG_PATH env var (if set)
    /// 2. ./drover.toml
    /// 3. ~/.config/drover/drover.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("DROVER_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "DROVER_CONFIG_PATH does not exist, ignoring");
        }

        let local_config = PathBuf::from("drover.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the first config file found, then apply env overrides
    pub fn load() -> Result<Self> {
        match Self::find_config_file() {
            Some(config_path) => Self::load_from(&config_path),
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Ok(Config::default().finish())
            }
        }
    }

    /// Load a specific config file, then apply env overrides
    pub fn load_from(config_path: &Path) -> Result<Self> {
        tracing::info!(path = %config_path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        Ok(config.finish())
    }

    /// Parse a TOML document and apply env overrides
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse drover config")?;
        Ok(config.finish())
    }

    fn finish(mut self) -> Self {
        if let Ok(val) = std::env::var("DROVER_WORKSPACE_PATH") {
            self.workspace.path = val;
        }
        if let Ok(val) = std::env::var("DROVER_DEFAULT_PROVIDER") {
            self.workspace.default_provider = val;
        }
        if let Ok(val) = std::env::var("DROVER_DISPATCHER") {
            self.dispatch.default_dispatcher = val;
        }

        self.workspace.path = expand_tilde(&self.workspace.path);

        // Agents default to "cli", so there is always a provider under that name
        if self.providers.is_empty() {
            self.providers
                .insert(default_provider(), ProviderConfig::new("cli"));
        }
        self
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(&self.workspace.path)
    }

    /// Sqlite database inside the workspace
    pub fn database_path(&self) -> PathBuf {
        self.workspace_dir().join("drover.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.dispatch.default_dispatcher, "system");
        assert_eq!(config.workspace.default_provider, "cli");
        assert!(!config.workspace.path.starts_with('~'));
        assert_eq!(config.providers["cli"].provider_type(), "cli");
    }

    #[test]
    fn test_provider_sections_pass_through() {
        let config = Config::parse(
            r#"
[workspace]
path = "/tmp/drover-ws"

[providers.opencode]
type = "server"
binary = "opencode"
startup_timeout_secs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/drover-ws/drover.db"));
        let section = &config.providers["opencode"];
        assert_eq!(section.provider_type(), "server");
        assert_eq!(section.to_json_value()["startup_timeout_secs"], 10);
        assert!(!config.providers.contains_key("cli"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert!(!expand_tilde("~/x").starts_with('~'));
    }
}
