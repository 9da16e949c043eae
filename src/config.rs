//! Module configuration
//!
//! Defaults, then an optional JSON file named by `ELE_PKCS11_CONFIG`, then
//! single-value environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default enclave mailbox node on i.MX93
pub const DEFAULT_DEVICE_PATH: &str = "/dev/ele_mu";

pub const ENV_CONFIG_FILE: &str = "ELE_PKCS11_CONFIG";
pub const ENV_DEVICE_PATH: &str = "ELE_PKCS11_DEVICE";
pub const ENV_TIMEOUT_MS: &str = "ELE_PKCS11_TIMEOUT_MS";

/// Tunables for a [`crate::Module`] instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Enclave command node
    pub device_path: PathBuf,
    /// Upper bound on a single device command
    pub command_timeout_ms: u64,
    /// How long a caller waits in the channel queue before `DeviceBusy`
    pub queue_timeout_ms: u64,
    /// Upper bound on the liveness probe during initialize
    pub probe_timeout_ms: u64,
    pub max_sessions: usize,
    pub token_label: String,
    /// Falls back to the module instance id when unset
    pub serial_number: Option<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            command_timeout_ms: 5_000,
            queue_timeout_ms: 10_000,
            probe_timeout_ms: 1_000,
            max_sessions: 64,
            token_label: "EdgeLock Enclave".to_string(),
            serial_number: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl ModuleConfig {
    /// Resolve configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration using `lookup` in place of the environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };

        if let Some(device) = lookup(ENV_DEVICE_PATH) {
            config.device_path = PathBuf::from(device);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            config.command_timeout_ms =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_TIMEOUT_MS.to_string(),
                        value: raw.clone(),
                    })?;
        }

        Ok(config)
    }

    /// Load a JSON config file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_config(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ele-pkcs11-{}-{}.json",
            name,
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = ModuleConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ModuleConfig::default());
        assert_eq!(config.device_path, PathBuf::from("/dev/ele_mu"));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_file_then_env_overrides() {
        let path = temp_config(
            "overrides",
            r#"{ "command_timeout_ms": 250, "token_label": "bench", "max_sessions": 4 }"#,
        );
        let env: HashMap<&str, String> = [
            (ENV_CONFIG_FILE, path.display().to_string()),
            (ENV_DEVICE_PATH, "/tmp/fake_mu".to_string()),
        ]
        .into_iter()
        .collect();

        let config = ModuleConfig::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(config.command_timeout_ms, 250);
        assert_eq!(config.token_label, "bench");
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.device_path, PathBuf::from("/tmp/fake_mu"));
        // untouched fields keep defaults
        assert_eq!(config.probe_timeout_ms, 1_000);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_bad_timeout_override() {
        let result = ModuleConfig::from_lookup(|k| {
            (k == ENV_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_unparseable_file() {
        let path = temp_config("broken", "{ not json");
        assert!(matches!(
            ModuleConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        std::fs::remove_file(path).unwrap();

        assert!(matches!(
            ModuleConfig::load("/nonexistent/ele.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
