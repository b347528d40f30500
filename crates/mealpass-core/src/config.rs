//! Application configuration management.
//!
//! Holds the API endpoint, request timeout, renewal timing, teardown cooldown
//! and storage backend. The timing values are policy knobs, not constants.
//!
//! Configuration is stored at `~/.config/mealpass/config.json`. Environment
//! variables (`MEALPASS_*`) override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::{ChaChaCipher, CryptoError, DEFAULT_SHARED_SECRET};
use crate::renewal::RenewalPolicy;
use crate::store::StorageBackend;

/// Application name used for config/storage directory paths
const APP_NAME: &str = "mealpass";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "https://api.mealpass.app/v1";

/// HTTP request timeout. Renewal calls rely on it too.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Renew this long before the token expires.
const DEFAULT_RENEWAL_LEAD_SECS: u64 = 5 * 60;

/// Longest single timer the scheduler arms.
const DEFAULT_RENEWAL_CHECK_INTERVAL_SECS: u64 = 60;

/// How long a 401 teardown suppresses further teardowns.
const DEFAULT_TEARDOWN_COOLDOWN_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub renewal_lead_secs: u64,
    pub renewal_check_interval_secs: u64,
    pub teardown_cooldown_ms: u64,
    pub storage: StorageBackend,
    /// Overrides the compiled-in storage secret.
    pub shared_secret: Option<String>,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            renewal_lead_secs: DEFAULT_RENEWAL_LEAD_SECS,
            renewal_check_interval_secs: DEFAULT_RENEWAL_CHECK_INTERVAL_SECS,
            teardown_cooldown_ms: DEFAULT_TEARDOWN_COOLDOWN_MS,
            storage: StorageBackend::default(),
            shared_secret: None,
            last_identifier: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Record the last sign-in identifier in the config file. Environment
    /// overrides are not written back.
    pub fn remember_identifier(identifier: &str) -> Result<()> {
        let path = Self::config_path()?;
        let mut stored = Self::load_from(&path)?;
        stored.last_identifier = Some(identifier.to_string());
        stored.save_to(&path)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the file storage backend.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find local data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Apply `MEALPASS_*` overrides from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("MEALPASS_API_URL") {
            self.api_base_url = url;
        }
        if let Some(raw) = lookup("MEALPASS_STORAGE") {
            match serde_json::from_value(serde_json::Value::String(raw.to_lowercase())) {
                Ok(backend) => self.storage = backend,
                Err(_) => warn!(value = %raw, "Ignoring unknown MEALPASS_STORAGE"),
            }
        }
        if let Some(secret) = lookup("MEALPASS_SHARED_SECRET") {
            self.shared_secret = Some(secret);
        }
        let numeric = [
            ("MEALPASS_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs),
            ("MEALPASS_RENEWAL_LEAD_SECS", &mut self.renewal_lead_secs),
            ("MEALPASS_RENEWAL_CHECK_INTERVAL_SECS", &mut self.renewal_check_interval_secs),
            ("MEALPASS_TEARDOWN_COOLDOWN_MS", &mut self.teardown_cooldown_ms),
        ];
        for (name, slot) in numeric {
            if let Some(raw) = lookup(name) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => warn!(variable = name, value = %raw, "Ignoring non-numeric override"),
                }
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn teardown_cooldown(&self) -> Duration {
        Duration::from_millis(self.teardown_cooldown_ms)
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            lead_time: Duration::from_secs(self.renewal_lead_secs),
            // A zero interval would spin the timer
            check_interval: Duration::from_secs(self.renewal_check_interval_secs.max(1)),
        }
    }

    pub fn cipher(&self) -> Result<ChaChaCipher, CryptoError> {
        let secret = self.shared_secret.as_deref().unwrap_or(DEFAULT_SHARED_SECRET);
        ChaChaCipher::from_secret(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.renewal_policy().lead_time, Duration::from_secs(300));
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = Config::default();
        config.last_identifier = Some("ops@example.com".to_string());
        config.storage = StorageBackend::File;
        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.last_identifier.as_deref(), Some("ops@example.com"));
        assert_eq!(loaded.storage, StorageBackend::File);

        std::fs::write(&path, r#"{"teardown_cooldown_ms": 50}"#).unwrap();
        let partial = Config::load_from(&path).unwrap();
        assert_eq!(partial.teardown_cooldown(), Duration::from_millis(50));
        assert_eq!(partial.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MEALPASS_API_URL", "http://localhost:9000"),
            ("MEALPASS_STORAGE", "Memory"),
            ("MEALPASS_RENEWAL_LEAD_SECS", "1800"),
            ("MEALPASS_RENEWAL_CHECK_INTERVAL_SECS", "0"),
            ("MEALPASS_REQUEST_TIMEOUT_SECS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.api_base_url, "http://localhost:9000");
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.renewal_policy().lead_time, Duration::from_secs(1800));
        assert_eq!(config.renewal_policy().check_interval, Duration::from_secs(1));
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }
}
