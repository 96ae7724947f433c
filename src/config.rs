//! Runtime configuration for bonding and re-authentication
//!
//! Loaded from a JSON file (every field optional) and then overridden from
//! `PERIBOND_*` environment variables.

use crate::storage::AccessPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest nonce the challenge-response engine will ever issue
pub const MIN_NONCE_LEN: usize = 16;

/// Tunables shared by the lifecycle manager, the record store and the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BondConfig {
    /// How long a bonding ceremony may stay open before it is discarded
    pub bonding_timeout_secs: u64,
    /// Bounded wait for a peripheral's challenge response
    pub response_timeout_ms: u64,
    /// Length of each challenge nonce in bytes
    pub nonce_len: usize,
    /// How many consumed nonce hashes are retained per bond
    pub nonce_history_len: usize,
    /// Extra attempts at reading the random source before giving up
    pub random_retry_limit: u32,
    /// Prefix for every secure-storage key owned by this crate
    pub key_namespace: String,
    /// Access policy applied to every bond record write
    pub storage_policy: AccessPolicy,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            bonding_timeout_secs: 120,
            response_timeout_ms: 5_000,
            nonce_len: 32,
            nonce_history_len: 32,
            random_retry_limit: 3,
            key_namespace: "bond:".to_string(),
            storage_policy: AccessPolicy::default(),
        }
    }
}

impl BondConfig {
    /// Load from a JSON file, apply environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let mut config: BondConfig =
            serde_json::from_str(&json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env()?;
        config.validate()?;
        log::info!("Loaded bond config from {}", path.display());
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `PERIBOND_*` variables that are set
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} is not a valid value: {:?}", name, raw)))
        }

        if let Some(v) = var("PERIBOND_BONDING_TIMEOUT_SECS") {
            self.bonding_timeout_secs = parse("PERIBOND_BONDING_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = var("PERIBOND_RESPONSE_TIMEOUT_MS") {
            self.response_timeout_ms = parse("PERIBOND_RESPONSE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = var("PERIBOND_NONCE_LEN") {
            self.nonce_len = parse("PERIBOND_NONCE_LEN", v)?;
        }
        if let Some(v) = var("PERIBOND_NONCE_HISTORY_LEN") {
            self.nonce_history_len = parse("PERIBOND_NONCE_HISTORY_LEN", v)?;
        }
        if let Some(v) = var("PERIBOND_RANDOM_RETRY_LIMIT") {
            self.random_retry_limit = parse("PERIBOND_RANDOM_RETRY_LIMIT", v)?;
        }
        if let Some(v) = var("PERIBOND_KEY_NAMESPACE") {
            self.key_namespace = v;
        }
        if let Some(v) = var("PERIBOND_REQUIRE_USER_PRESENCE") {
            self.storage_policy.require_user_presence = parse("PERIBOND_REQUIRE_USER_PRESENCE", v)?;
        }
        Ok(())
    }

    /// Reject settings the trust protocol cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nonce_len < MIN_NONCE_LEN || self.nonce_len > u8::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "nonce_len must be between {} and {}, got {}",
                MIN_NONCE_LEN,
                u8::MAX,
                self.nonce_len
            )));
        }
        if self.nonce_history_len == 0 {
            return Err(ConfigError::Invalid("nonce_history_len must be at least 1".into()));
        }
        if self.bonding_timeout_secs == 0 || self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.key_namespace.is_empty() {
            return Err(ConfigError::Invalid("key_namespace must not be empty".into()));
        }
        Ok(())
    }

    pub fn bonding_timeout(&self) -> Duration {
        Duration::from_secs(self.bonding_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(String),

    #[error("Cannot parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = BondConfig::default();
        config.validate().unwrap();
        assert_eq!(config.nonce_len, 32);
        assert_eq!(config.key_namespace, "bond:");
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BondConfig =
            serde_json::from_str(r#"{"nonce_len": 24, "storage_policy": {"require_user_presence": true}}"#)
                .unwrap();
        assert_eq!(config.nonce_len, 24);
        assert!(config.storage_policy.require_user_presence);
        assert_eq!(config.bonding_timeout_secs, 120);
    }

    #[test]
    fn test_short_nonce_rejected() {
        let config = BondConfig { nonce_len: 8, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PERIBOND_NONCE_LEN", "48"),
            ("PERIBOND_KEY_NAMESPACE", "ring:"),
            ("PERIBOND_REQUIRE_USER_PRESENCE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = BondConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.nonce_len, 48);
        assert_eq!(config.key_namespace, "ring:");
        assert!(config.storage_policy.require_user_presence);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = BondConfig::default();
        let err = config
            .apply_vars(|name| (name == "PERIBOND_RESPONSE_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("peribond-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bond.json");
        std::fs::write(&path, r#"{"bonding_timeout_secs": 30}"#).unwrap();

        let config = BondConfig::load(&path).unwrap();
        assert_eq!(config.bonding_timeout(), Duration::from_secs(30));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
