// ABOUTME: Standardized paths for config, data and log storage
// ABOUTME: Uses ~/.config/drover for config; logs live inside the workspace

use directories::BaseDirs;
use std::path::PathBuf;

/// Get the home directory
pub fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the config directory path: ~/.config/drover/
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("drover")
}

/// Get the default config file path: ~/.config/drover/drover.toml
pub fn config_file() -> PathBuf {
    config_dir().join("drover.toml")
}

/// Get the log directory for a workspace: <workspace>/logs/
pub fn log_dir(workspace: &std::path::Path) -> PathBuf {
    workspace.join("logs")
}
