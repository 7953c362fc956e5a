// ABOUTME: XDG Base Directory paths for cross-platform config and data storage
// ABOUTME: Provides standardized paths for logs, the session directory, and configuration

use directories::ProjectDirs;
use std::path::PathBuf;

/// Application identifier for XDG directories
const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "warelay";
const APPLICATION: &str = "warelay";

/// Get XDG-compliant directories for the application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Get the data directory path (e.g., ~/.local/share/warelay/)
/// Falls back to ./data if XDG directories unavailable
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Get the log directory path (inside data dir)
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Get the config directory path (e.g., ~/.config/warelay/)
/// Falls back to current directory if XDG directories unavailable
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default config file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Expand tilde (~) to home directory in paths.
/// Logs a warning if expansion fails and falls back to the original path.
pub fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    } else if path == "~" {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs.home_dir().to_string_lossy().to_string();
        }
        tracing::warn!("Failed to expand tilde: could not determine home directory");
    }
    path.to_string()
}
