//! Configuration Module
//!
//! Handles loading configuration from:
//! 1. `$CS_CONFIG`, ~/.coinshuffle/config.toml or ./config.toml (first found)
//! 2. Environment variables (override TOML values)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::error::ShuffleError;

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".coinshuffle";

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Per-session protocol parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Value every player contributes and receives, in base units
    #[serde(default = "default_amount")]
    pub amount: u64,
    /// Rounds that may end in blame before the session gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fewest surviving players worth running a round for
    #[serde(default = "default_min_players")]
    pub min_players: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            amount: default_amount(),
            max_retries: default_max_retries(),
            min_players: default_min_players(),
        }
    }
}

fn default_amount() -> u64 {
    100_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_players() -> usize {
    3
}

/// Transport parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bound on every blocking receive; also ends blame collection
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

fn default_receive_timeout() -> u64 {
    5000
}

impl SessionConfig {
    pub fn validate(&self) -> std::result::Result<(), ShuffleError> {
        if self.amount == 0 {
            return Err(ShuffleError::InvalidConfig("amount must be positive".into()));
        }
        if self.min_players < 2 {
            return Err(ShuffleError::InvalidConfig(format!(
                "min_players must be at least 2, got {}",
                self.min_players
            )));
        }
        Ok(())
    }
}

impl ShuffleConfig {
    /// Load configuration from the first config file found, with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(config_path) => Self::load_from(&config_path)?,
            None => {
                tracing::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one config file, without env overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("CS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(config_path) = Self::default_config_path() {
            if config_path.exists() {
                return Some(config_path);
            }
        }

        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        None
    }

    /// Apply environment variable overrides; unparsable values are ignored
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("CS_AMOUNT") {
            if let Ok(n) = v.parse() {
                self.session.amount = n;
            }
        }
        if let Ok(v) = env::var("CS_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.session.max_retries = n;
            }
        }
        if let Ok(v) = env::var("CS_MIN_PLAYERS") {
            if let Ok(n) = v.parse() {
                self.session.min_players = n;
            }
        }
        if let Ok(v) = env::var("CS_RECEIVE_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.network.receive_timeout_ms = n;
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ShuffleError> {
        self.session.validate()?;
        if self.network.receive_timeout_ms == 0 {
            return Err(ShuffleError::InvalidConfig(
                "receive_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ShuffleConfig::default();
        assert_eq!(config.session.amount, 100_000);
        assert_eq!(config.session.max_retries, 3);
        assert_eq!(config.session.min_players, 3);
        assert_eq!(config.network.receive_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let sample = ShuffleConfig::generate_sample();
        assert!(sample.contains("[session]"));
        assert!(sample.contains("[network]"));

        let parsed: ShuffleConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed, ShuffleConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\namount = 2500\nmin_players = 4").unwrap();

        let config = ShuffleConfig::load_from(file.path()).unwrap();
        assert_eq!(config.session.amount, 2500);
        assert_eq!(config.session.min_players, 4);
        assert_eq!(config.session.max_retries, 3);
        assert_eq!(config.network.receive_timeout_ms, 5000);
    }

    #[test]
    fn test_unparsable_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session\namount = ").unwrap();

        let err = ShuffleConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_validation_rejects_degenerate_sessions() {
        let mut config = ShuffleConfig::default();
        config.session.amount = 0;
        assert!(matches!(config.validate(), Err(ShuffleError::InvalidConfig(_))));

        let mut config = ShuffleConfig::default();
        config.session.min_players = 1;
        assert!(matches!(config.validate(), Err(ShuffleError::InvalidConfig(_))));
    }
}
