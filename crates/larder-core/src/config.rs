//! Application configuration management.
//!
//! Holds the API base URL, HTTP timeout, refresh cadence and which token
//! storage back-end to use. Stored at `~/.config/larder/config.json`, with
//! `LARDER_*` environment variables taking precedence.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::expiry::DEFAULT_EXPIRY_BUFFER_SECS;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "larder";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Encrypted token file name (encrypted-file back-end)
const TOKEN_FILE: &str = "tokens.json";

pub const ENV_API_BASE_URL: &str = "LARDER_API_BASE_URL";
pub const ENV_TOKEN_BACKEND: &str = "LARDER_TOKEN_BACKEND";
pub const ENV_STORE_PASSPHRASE: &str = "LARDER_STORE_PASSPHRASE";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
/// A timeout counts as a network error, never as an auth failure.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Where the token pair is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TokenBackend {
    /// Platform keychain
    #[default]
    Keyring,
    /// Passphrase-sealed file in the cache directory
    EncryptedFile,
    /// Process memory only
    Memory,
}

impl FromStr for TokenBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "keyring" => Ok(TokenBackend::Keyring),
            "encrypted-file" | "file" => Ok(TokenBackend::EncryptedFile),
            "memory" => Ok(TokenBackend::Memory),
            other => Err(anyhow!("Unknown token backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub expiry_buffer_secs: i64,
    pub token_backend: TokenBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER_SECS,
            token_backend: TokenBackend::default(),
        }
    }
}

impl Config {
    /// Load from disk (or defaults), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        debug!(api_base_url = %config.api_base_url, backend = ?config.token_backend, "Config loaded");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup (normally the process env)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(backend) = lookup(ENV_TOKEN_BACKEND).filter(|v| !v.trim().is_empty()) {
            self.token_backend = backend.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn token_file(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join(TOKEN_FILE))
    }

    /// Base URL without a trailing slash
    pub fn api_base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_buffer_secs.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.refresh_interval(), Duration::from_secs(300));
        assert_eq!(config.expiry_buffer(), chrono::Duration::minutes(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.token_backend, TokenBackend::Keyring);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url":"https://api.example.com/","token_backend":"encrypted-file"}"#)
                .unwrap();
        assert_eq!(config.api_base_url(), "https://api.example.com");
        assert_eq!(config.token_backend, TokenBackend::EncryptedFile);
        assert_eq!(config.refresh_interval_secs, 300);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_API_BASE_URL, "https://staging.example.com"),
            (ENV_TOKEN_BACKEND, "memory"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api_base_url, "https://staging.example.com");
        assert_eq!(config.token_backend, TokenBackend::Memory);
    }

    #[test]
    fn test_env_rejects_unknown_backend() {
        let mut config = Config::default();
        let result = config.apply_env(|key| {
            (key == ENV_TOKEN_BACKEND).then(|| "floppy-disk".to_string())
        });
        assert!(result.is_err());
    }
}
