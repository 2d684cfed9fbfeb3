use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Origin the relative request paths are resolved against
  pub base_url: String,
  /// Prefix shared by API routes; route families start after it
  #[serde(default = "default_api_base_path")]
  pub api_base_path: String,
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: i64,
  pub page_ttl_secs: i64,
  /// Read routes served cache-first. A trailing `*` matches a prefix.
  pub routes: Vec<String>,
  /// GET routes treated as page loads
  pub document_routes: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 24 * 60 * 60,
      page_ttl_secs: 7 * 24 * 60 * 60,
      routes: Vec::new(),
      document_routes: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  pub debounce_ms: u64,
  pub page_timeout_ms: u64,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
  pub probe_interval_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      debounce_ms: 2_000,
      page_timeout_ms: 3_000,
      backoff_base_ms: 1_000,
      backoff_max_ms: 30_000,
      probe_interval_ms: 5_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// Byte quota for stored keys and values
  pub max_bytes: Option<usize>,
}

fn default_api_base_path() -> String {
  "/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
  10_000
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(SyncError::Config(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml\n\
                 See offsync.example.yaml for the format."
          .to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::parse(&contents).map_err(|e| {
      SyncError::Config(format!(
        "Failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))?;
    if config.cache.ttl_secs <= 0 || config.cache.page_ttl_secs <= 0 {
      return Err(SyncError::InvalidTtl);
    }
    Ok(config)
  }

  /// Session token sent as a bearer credential, from OFFSYNC_SESSION_TOKEN.
  pub fn session_token() -> Option<String> {
    std::env::var("OFFSYNC_SESSION_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("backend:\n  base_url: https://school.example.com\n").unwrap();
    assert_eq!(config.backend.api_base_path, "/api");
    assert_eq!(config.cache.ttl_secs, 86_400);
    assert_eq!(config.cache.page_ttl_secs, 604_800);
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.debounce_ms, 2_000);
    assert_eq!(config.sync.page_timeout_ms, 3_000);
    assert!(config.storage.path.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
backend:
  base_url: https://school.example.com
  api_base_path: /v2
cache:
  ttl_secs: 600
  routes:
    - /v2/subjects*
    - /v2/profile
  document_routes:
    - /dashboard*
sync:
  max_retries: 5
  backoff_max_ms: 10000
storage:
  path: /tmp/offsync.db
  max_bytes: 1048576
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.backend.api_base_path, "/v2");
    assert_eq!(config.cache.ttl_secs, 600);
    assert_eq!(config.cache.page_ttl_secs, 604_800);
    assert_eq!(config.cache.routes, vec!["/v2/subjects*", "/v2/profile"]);
    assert_eq!(config.cache.document_routes, vec!["/dashboard*"]);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.backoff_base_ms, 1_000);
    assert_eq!(config.sync.backoff_max_ms, 10_000);
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/offsync.db")));
    assert_eq!(config.storage.max_bytes, Some(1_048_576));
  }

  #[test]
  fn test_rejects_non_positive_ttl() {
    let yaml = "backend:\n  base_url: http://localhost\ncache:\n  ttl_secs: 0\n";
    assert!(matches!(Config::parse(yaml), Err(SyncError::InvalidTtl)));
    assert!(matches!(Config::parse("backend: ["), Err(SyncError::Config(_))));
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/offsync.yaml"))).unwrap_err();
    assert!(matches!(err, SyncError::Config(ref msg) if msg.contains("Config file not found")));
  }
}
