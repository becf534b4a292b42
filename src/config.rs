//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the [`RelayConfig`] struct, which holds the configuration parameters,
//! and a [`load_config`] function to load the configuration from a YAML file.
//! Provider credentials may also come from the environment (`OPENROUTER_API_KEY`,
//! `OPENROUTER_BASE_URL`), which take precedence over the file.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use chatrelay::config::{RelayConfig, load_config};
//!
//! let config_file_path = "/path/to/config.yaml";
//! let config: RelayConfig = load_config(config_file_path).unwrap();
//! println!("{:?}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::{env, fs};

use tracing::debug;

use crate::error::{RelayError, Result};

/// Environment variable that overrides [`RelayConfig::api_key`].
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Environment variable that overrides [`RelayConfig::api_base`].
pub const API_BASE_ENV: &str = "OPENROUTER_BASE_URL";

/// Represents the application's configuration.
///
/// This struct holds the parameters needed to run the relay: where the LLM
/// provider lives, which model to fall back to, where the SQLite database is,
/// and where the HTTP transport listens.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RelayConfig {
    /// The base URL of the provider API (e.g. `https://openrouter.ai/api/v1`).
    pub api_base: String,

    /// The API key used to authenticate requests to the provider.
    #[serde(default)]
    pub api_key: String,

    /// Provider-facing identifier of the model used when a request names none.
    #[serde(default)]
    pub default_model: Option<String>,

    // Chat database url (SQLite)
    pub database_url: String,

    // How many earlier messages are sent upstream as context.
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,

    // Address the HTTP transport binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_history_limit() -> i64 {
    10
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base: "https://openrouter.ai/api/v1".to_string(),
            api_key: String::new(),
            default_model: Some("google/gemini-flash-1.5".to_string()),
            database_url: "chatrelay.db".to_string(),
            history_limit: default_history_limit(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl RelayConfig {
    /// Apply `OPENROUTER_API_KEY` / `OPENROUTER_BASE_URL` on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(env::var(API_KEY_ENV).ok(), env::var(API_BASE_ENV).ok());
    }

    fn apply_overrides(&mut self, api_key: Option<String>, api_base: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            debug!("API key taken from {}", API_KEY_ENV);
            self.api_key = key;
        }
        if let Some(base) = api_base.filter(|b| !b.trim().is_empty()) {
            debug!("API base taken from {}", API_BASE_ENV);
            self.api_base = base;
        }
    }
}

/// Loads the application's configuration from a YAML file.
///
/// This function reads the file at the given path, parses it as YAML, and
/// constructs a `RelayConfig` from it. Environment overrides are applied
/// afterwards.
///
/// # Errors
///
/// Returns [`RelayError::Config`] if the file cannot be read or parsed.
pub fn load_config(file: &str) -> Result<RelayConfig> {
    debug!("Loading config from: {}", file);
    let content = fs::read_to_string(file)
        .map_err(|e| RelayError::Config(format!("cannot read {file}: {e}")))?;
    let mut config: RelayConfig = serde_yaml::from_str(&content)
        .map_err(|e| RelayError::Config(format!("cannot parse {file}: {e}")))?;
    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
api_base: "http://example.com/api/v1"
api_key: "example_api_key"
default_model: "vendor/model-a"
database_url: "relay.db"
history_limit: 4
"#
        )
        .unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());

        assert!(config.is_ok());
        let config = config.unwrap();
        assert_eq!(config.api_base, "http://example.com/api/v1");
        assert_eq!(config.default_model.as_deref(), Some("vendor/model-a"));
        assert_eq!(config.database_url, "relay.db");
        assert_eq!(config.history_limit, 4);
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config("non/existent/path");
        assert!(matches!(config, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());
        assert!(config.is_err());
    }

    #[test]
    fn test_env_values_win_over_file_values() {
        let mut config = RelayConfig::default();
        config.api_key = "from-file".into();
        config.apply_overrides(Some("from-env".into()), None);
        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.api_base, "https://openrouter.ai/api/v1");

        // Blank environment values are ignored.
        config.apply_overrides(Some("  ".into()), Some(String::new()));
        assert_eq!(config.api_key, "from-env");
    }
}
