//! Configuration loading.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::persist::DEFAULT_QUOTA_BYTES;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the operations API, e.g. `https://api.prepline.io/v1`.
  pub url: String,
  /// Account identifier, used to namespace persisted snapshots.
  pub account: String,
  /// Environment variable holding the bearer token.
  #[serde(default = "default_token_env")]
  pub token_env: String,
}

fn default_token_env() -> String {
  "PREPLINE_TOKEN".to_string()
}

impl ApiConfig {
  /// Read the bearer token from the configured environment variable.
  pub fn token(&self) -> Result<String> {
    std::env::var(&self.token_env)
      .map_err(|_| Error::Config(format!("API token not set; export {}", self.token_env)))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Persist snapshots to disk. Disable for ephemeral environments.
  pub persist: bool,
  /// Byte quota for persisted snapshots.
  pub quota_bytes: u64,
  /// TTL for list metadata (changes rarely).
  pub list_ttl_minutes: i64,
  /// TTL for instance and waste data (changes often).
  pub instance_ttl_minutes: i64,
  pub retry_max_attempts: u32,
  pub retry_base_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      quota_bytes: DEFAULT_QUOTA_BYTES,
      list_ttl_minutes: 5,
      instance_ttl_minutes: 2,
      retry_max_attempts: 3,
      retry_base_delay_ms: 500,
    }
  }
}

impl CacheConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry_max_attempts,
      base_delay: Duration::from_millis(self.retry_base_delay_ms),
    }
  }

  pub fn list_ttl(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.list_ttl_minutes)
  }

  pub fn instance_ttl(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.instance_ttl_minutes)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./prepline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/prepline/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!("config file not found: {}", p.display())));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::Config(
        "no configuration file found; create one at ~/.config/prepline/config.yaml".to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("prepline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("prepline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    Self::from_yaml(&contents)
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| Error::Config(format!("invalid config: {e}")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  const MINIMAL: &str = "api:\n  url: https://api.prepline.io/v1\n  account: gm@store42\n";

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    assert_eq!(config.api.token_env, "PREPLINE_TOKEN");
    assert!(config.cache.persist);
    assert_eq!(config.cache.list_ttl(), chrono::Duration::minutes(5));
    assert_eq!(config.cache.instance_ttl(), chrono::Duration::minutes(2));
    assert_eq!(config.cache.retry_policy().max_attempts, 3);
  }

  #[test]
  fn test_cache_overrides_are_honored() {
    let yaml = format!(
      "{MINIMAL}cache:\n  persist: false\n  instance_ttl_minutes: 1\n  retry_max_attempts: 5\n"
    );
    let config = Config::from_yaml(&yaml).unwrap();
    assert!(!config.cache.persist);
    assert_eq!(config.cache.instance_ttl(), chrono::Duration::minutes(1));
    assert_eq!(config.cache.retry_policy().max_attempts, 5);
  }

  #[test]
  fn test_load_from_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.api.account, "gm@store42");
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/nonexistent/prepline.yaml"))).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }
}
