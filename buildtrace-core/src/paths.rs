//! Centralized path configuration.
//!
//! The pipeline shares its configuration directory with the docker CLI so that
//! stored credentials, proxy settings and the build node id are picked up
//! without extra setup.

use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "BUILDTRACE_CONFIG_DIR";

/// Environment variable overriding the settings file path.
pub const SETTINGS_FILE_ENV: &str = "BUILDTRACE_CONFIG";

/// Get the configuration directory.
///
/// Resolution order:
/// 1. `BUILDTRACE_CONFIG_DIR` environment variable
/// 2. `DOCKER_CONFIG` environment variable
/// 3. `~/.docker`
pub fn config_dir() -> PathBuf {
    resolve_config_dir(
        std::env::var(CONFIG_DIR_ENV).ok().as_deref(),
        std::env::var("DOCKER_CONFIG").ok().as_deref(),
        dirs::home_dir().as_deref(),
    )
}

fn resolve_config_dir(
    override_dir: Option<&str>,
    docker_config: Option<&str>,
    home: Option<&Path>,
) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    if let Some(dir) = docker_config.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    home.map(|h| h.join(".docker")).unwrap_or_else(|| PathBuf::from(".docker"))
}

/// Get the client config file holding credentials and proxies.
pub fn client_config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Get the pipeline settings file (`BUILDTRACE_CONFIG` wins if set).
pub fn settings_path() -> PathBuf {
    match std::env::var(SETTINGS_FILE_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_dir().join("buildtrace.json"),
    }
}

/// Get the file holding this machine's build node identifier.
pub fn build_node_id_path(config_dir: &Path) -> PathBuf {
    config_dir.join(".buildNodeID")
}
