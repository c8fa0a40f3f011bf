//! Configuration management for lightwave-smart
//!
//! This module handles loading, parsing and validating configuration from a
//! YAML file, environment variables and CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LightwaveError, Result};
use crate::link::activation::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where credentials and the pending flow continuation are kept
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retry behaviour for installation setup
    #[serde(default)]
    pub activation: ActivationConfig,
    /// Retry behaviour for interactive credential validation
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Durable storage backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Embedded sled database
    #[default]
    Sled,
    /// OS native keyring
    Keyring,
    /// Process memory only
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = LightwaveError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "keyring" => Ok(StorageBackend::Keyring),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(LightwaveError::Config(format!(
                "Invalid storage backend: {}. Must be one of: sled, keyring, memory",
                other
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database directory for the sled backend. Defaults to the platform data
    /// directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Installation setup retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationConfig {
    #[serde(default = "default_activation_retries")]
    pub retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

fn default_activation_retries() -> u32 {
    6
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            retries: default_activation_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl ActivationConfig {
    /// Retry policy used by installation setup.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

/// Credential validation retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_validation_retries")]
    pub retries: u32,
}

fn default_validation_retries() -> u32 {
    3
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            retries: default_validation_retries(),
        }
    }
}

impl ValidationConfig {
    /// Retry policy used while the user waits: no backoff.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::interactive().with_max_attempts(self.retries)
    }
}

impl Config {
    /// Load configuration from file with environment overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LightwaveError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| LightwaveError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(backend) = std::env::var("LIGHTWAVE_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(value) => self.storage.backend = value,
                Err(_) => tracing::warn!("Invalid LIGHTWAVE_STORAGE_BACKEND: {}", backend),
            }
        }

        if let Ok(path) = std::env::var("LIGHTWAVE_STORAGE_PATH") {
            self.storage.path = Some(PathBuf::from(path));
        }

        if let Ok(retries) = std::env::var("LIGHTWAVE_ACTIVATION_RETRIES") {
            if let Ok(value) = retries.parse() {
                self.activation.retries = value;
            } else {
                tracing::warn!("Invalid LIGHTWAVE_ACTIVATION_RETRIES: {}", retries);
            }
        }

        if let Ok(retries) = std::env::var("LIGHTWAVE_VALIDATION_RETRIES") {
            if let Ok(value) = retries.parse() {
                self.validation.retries = value;
            } else {
                tracing::warn!("Invalid LIGHTWAVE_VALIDATION_RETRIES: {}", retries);
            }
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.activation.retries == 0 {
            return Err(
                LightwaveError::Config("activation.retries must be greater than 0".to_string())
                    .into(),
            );
        }

        if self.validation.retries == 0 {
            return Err(
                LightwaveError::Config("validation.retries must be greater than 0".to_string())
                    .into(),
            );
        }

        if self.activation.initial_backoff_ms > self.activation.max_backoff_ms {
            return Err(LightwaveError::Config(
                "activation.initial_backoff_ms must not exceed activation.max_backoff_ms"
                    .to_string(),
            )
            .into());
        }

        if self.activation.attempt_timeout_secs == 0 {
            return Err(LightwaveError::Config(
                "activation.attempt_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.storage.backend != StorageBackend::Sled && self.storage.path.is_some() {
            tracing::warn!(
                "storage.path is only used by the sled backend, ignoring it for {:?}",
                self.storage.backend
            );
        }

        Ok(())
    }
}
