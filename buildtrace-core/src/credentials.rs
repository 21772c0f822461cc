//! Registry credentials and proxy settings from the client config file.
//!
//! Reads the docker-style `config.json` in the configuration directory. Only the
//! parts the build pipeline needs are modelled: inline `auths` entries and the
//! `proxies` table.

use crate::error::{BuildError, Result};
use crate::paths;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key of the proxy settings used when no host-specific entry exists.
pub const DEFAULT_PROXY_KEY: &str = "default";

/// Credentials for one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: String,
    #[serde(default, rename = "serveraddress")]
    pub server_address: String,
    #[serde(default, rename = "identitytoken")]
    pub identity_token: String,
    #[serde(default, rename = "registrytoken")]
    pub registry_token: String,
}

/// Proxy settings passed to build steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub http_proxy: String,
    #[serde(default)]
    pub https_proxy: String,
    #[serde(default)]
    pub no_proxy: String,
    #[serde(default)]
    pub ftp_proxy: String,
    #[serde(default)]
    pub all_proxy: String,
}

impl ProxySettings {
    /// Build args for the configured proxies, in upper- and lower-case form.
    pub fn build_args(&self) -> Vec<(String, String)> {
        let pairs = [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
            ("NO_PROXY", &self.no_proxy),
            ("FTP_PROXY", &self.ftp_proxy),
            ("ALL_PROXY", &self.all_proxy),
        ];

        pairs
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .flat_map(|(key, value)| {
                [(key.to_string(), value.clone()), (key.to_lowercase(), value.clone())]
            })
            .collect()
    }

    /// Add proxy build args without overriding any arg already present.
    pub fn apply_to(&self, build_args: &mut HashMap<String, String>) {
        for (key, value) in self.build_args() {
            build_args.entry(key).or_insert(value);
        }
    }
}

/// Source of registry credentials and proxy settings for builds.
pub trait CredentialProvider: Send + Sync {
    /// All stored credentials, keyed by registry address.
    fn all_credentials(&self) -> HashMap<String, AuthConfig>;

    /// Proxy settings for the given daemon host.
    fn proxy_settings(&self, host: &str) -> ProxySettings;
}

/// The parts of the client `config.json` the pipeline reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthConfig>,
    #[serde(default)]
    proxies: HashMap<String, ProxySettings>,
}

impl ClientConfigFile {
    /// Location of the config file in the configuration directory.
    pub fn default_path() -> PathBuf {
        paths::client_config_path()
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from a specific file. A missing file yields an empty configuration.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No client config file, using empty configuration");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Io { path: path.to_path_buf(), source: e })?;
        Self::parse(&content).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}

impl CredentialProvider for ClientConfigFile {
    fn all_credentials(&self) -> HashMap<String, AuthConfig> {
        self.auths
            .iter()
            .map(|(registry, entry)| {
                let mut auth = entry.clone();
                auth.server_address = registry.clone();

                if !entry.auth.is_empty() {
                    match decode_auth(&entry.auth) {
                        Some((username, password)) => {
                            auth.username = username;
                            auth.password = password;
                        }
                        // Unreadable entries are skipped rather than failing the build.
                        None => warn!(registry = %registry, "Ignoring malformed auth entry"),
                    }
                }

                (registry.clone(), auth)
            })
            .collect()
    }

    fn proxy_settings(&self, host: &str) -> ProxySettings {
        self.proxies
            .get(host)
            .or_else(|| self.proxies.get(DEFAULT_PROXY_KEY))
            .cloned()
            .unwrap_or_default()
    }
}

/// Decode a base64 `user:password` auth string.
fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.trim_end_matches('\0').to_string()))
}
