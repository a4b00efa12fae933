//! Configuration management for redlimit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{LimiterError, Result};

/// Prefix for environment variable overrides, e.g. `REDLIMIT_STORE__URL`.
pub const ENV_PREFIX: &str = "REDLIMIT";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterOptions,
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection url
    #[serde(default = "default_url")]
    pub url: String,

    /// Bound on connecting and on every round trip
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_url(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_response_timeout() -> u64 {
    500
}

/// Limiting semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Counter with a window pinned to the first hit after expiry
    #[default]
    Fixed,
    /// Rolling log of hit timestamps
    Sliding,
}

/// How the atomic step reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// Server-side Lua script, evaluated by hash
    #[default]
    Scripted,
    /// MULTI/EXEC issued by the client
    Transactional,
}

impl FromStr for Algorithm {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Algorithm::Fixed),
            "sliding" => Ok(Algorithm::Sliding),
            other => Err(LimiterError::Config(format!("unknown algorithm: {}", other))),
        }
    }
}

impl FromStr for Execution {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scripted" | "lua" => Ok(Execution::Scripted),
            "transactional" | "multi" => Ok(Execution::Transactional),
            other => Err(LimiterError::Config(format!("unknown execution mode: {}", other))),
        }
    }
}

/// Limiter configuration, fixed for the lifetime of a limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Prepended to every caller key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default)]
    pub execution: Execution,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            algorithm: Algorithm::default(),
            execution: Execution::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "rlimit:".to_string()
}

impl Settings {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply `REDLIMIT_*` environment overrides.
    ///
    /// Nested fields use a double underscore: `REDLIMIT_LIMITER__ALGORITHM=sliding`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.store.url, "redis://127.0.0.1:6379");
        assert_eq!(settings.store.response_timeout_ms, 500);
        assert_eq!(settings.limiter.key_prefix, "rlimit:");
        assert_eq!(settings.limiter.algorithm, Algorithm::Fixed);
        assert_eq!(settings.limiter.execution, Execution::Scripted);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  backend: memory
limiter:
  key_prefix: "api:"
  algorithm: sliding
  execution: transactional
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.url, "redis://127.0.0.1:6379");
        assert_eq!(settings.limiter.key_prefix, "api:");
        assert_eq!(settings.limiter.algorithm, Algorithm::Sliding);
        assert_eq!(settings.limiter.execution, Execution::Transactional);
    }

    #[test]
    fn test_unknown_algorithm_fails_at_parse_time() {
        let yaml = r#"
limiter:
  algorithm: leaky
"#;
        assert!(matches!(Settings::from_yaml(yaml), Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_from_str() {
        assert_eq!("Sliding".parse::<Algorithm>().unwrap(), Algorithm::Sliding);
        assert_eq!("fixed".parse::<Algorithm>().unwrap(), Algorithm::Fixed);
        assert_eq!("lua".parse::<Execution>().unwrap(), Execution::Scripted);
        assert_eq!("multi".parse::<Execution>().unwrap(), Execution::Transactional);
        assert!("token".parse::<Algorithm>().is_err());
        assert!("pipeline".parse::<Execution>().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("redlimit-{}.yaml", std::process::id()));
        std::fs::write(&path, "store:\n  response_timeout_ms: 250\n").unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.store.response_timeout_ms, 250);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("redlimit-env-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  algorithm: sliding\n  key_prefix: \"file:\"\n").unwrap();
        std::env::set_var("REDLIMIT_STORE__RESPONSE_TIMEOUT_MS", "900");

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.limiter.algorithm, Algorithm::Sliding);
        assert_eq!(settings.limiter.key_prefix, "file:");
        assert_eq!(settings.store.response_timeout_ms, 900);

        std::env::remove_var("REDLIMIT_STORE__RESPONSE_TIMEOUT_MS");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            Settings::from_file("/nonexistent/redlimit.yaml"),
            Err(LimiterError::Io(_))
        ));
    }
}
