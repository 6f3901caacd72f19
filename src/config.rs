use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::query::CacheConfig;
use crate::storage::SqliteStore;
use crate::todos::DEFAULT_PER_PAGE;

/// Environment variable overriding `api.base_url`.
pub const BASE_URL_ENV: &str = "TASKQ_BASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub tasks: TasksConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
  /// Root of the task server, e.g. `http://localhost:3000`
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// How long fetched data counts as fresh
  pub stale_time_secs: u64,
  /// How long unobserved data is kept
  pub gc_time_secs: u64,
  /// Extra attempts for failed reads
  pub retry: u32,
  /// First retry delay; doubles on each attempt
  pub retry_delay_ms: u64,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 60,
      gc_time_secs: 300,
      retry: 2,
      retry_delay_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
  pub per_page: u32,
}

impl Default for TasksConfig {
  fn default() -> Self {
    Self {
      per_page: DEFAULT_PER_PAGE,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Session database (default: <data dir>/taskq/session.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskq/config.yaml
  ///
  /// Without any file the defaults apply; the base URL can then come from
  /// the environment.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("taskq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// The API base URL: command line first, then [`BASE_URL_ENV`], then the
  /// config file. Missing or malformed is fatal.
  pub fn base_url(&self, cli: Option<&str>) -> Result<Url> {
    let env = std::env::var(BASE_URL_ENV).ok();
    self.resolve_base_url(cli, env.as_deref())
  }

  fn resolve_base_url(&self, cli: Option<&str>, env: Option<&str>) -> Result<Url> {
    let raw = cli
      .or(env)
      .or(self.api.base_url.as_deref())
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .ok_or_else(|| {
        eyre!(
          "API base URL not configured. Set {} or api.base_url in ~/.config/taskq/config.yaml",
          BASE_URL_ENV
        )
      })?;

    let url = Url::parse(raw).map_err(|e| eyre!("Invalid API base URL {}: {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("API base URL must be http or https: {}", raw));
    }
    Ok(url)
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      stale_time: Duration::from_secs(self.query.stale_time_secs),
      gc_time: Duration::from_secs(self.query.gc_time_secs),
      retry: self.query.retry,
      retry_delay: Duration::from_millis(self.query.retry_delay_ms),
    }
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStore::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_sections_missing() {
    let config = Config::parse("api:\n  base_url: http://localhost:3000\n").unwrap();
    assert_eq!(config.query.stale_time_secs, 60);
    assert_eq!(config.query.gc_time_secs, 300);
    assert_eq!(config.query.retry, 2);
    assert_eq!(config.tasks.per_page, 10);
    assert!(config.storage.path.is_none());

    let cache = config.cache_config();
    assert_eq!(cache.stale_time, Duration::from_secs(60));
    assert_eq!(cache.retry_delay, Duration::from_secs(1));
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::parse("query:\n  retry: 0\ntasks:\n  per_page: 25\n").unwrap();
    assert_eq!(config.query.retry, 0);
    assert_eq!(config.query.stale_time_secs, 60);
    assert_eq!(config.tasks.per_page, 25);
  }

  #[test]
  fn test_empty_file_is_default() {
    let config = Config::parse("").unwrap();
    assert!(config.api.base_url.is_none());
  }

  #[test]
  fn test_missing_base_url_is_fatal() {
    let config = Config::default();
    let error = config.resolve_base_url(None, None).unwrap_err();
    assert!(error.to_string().contains(BASE_URL_ENV));
  }

  #[test]
  fn test_base_url_precedence() {
    let config = Config::parse("api:\n  base_url: http://file:1\n").unwrap();

    let url = config.resolve_base_url(None, None).unwrap();
    assert_eq!(url.as_str(), "http://file:1/");

    let url = config.resolve_base_url(None, Some("http://env:2")).unwrap();
    assert_eq!(url.as_str(), "http://env:2/");

    let url = config
      .resolve_base_url(Some("http://cli:3"), Some("http://env:2"))
      .unwrap();
    assert_eq!(url.as_str(), "http://cli:3/");
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    let config = Config::default();
    assert!(config.resolve_base_url(Some("not a url"), None).is_err());
    assert!(config.resolve_base_url(Some("ftp://host"), None).is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }

  #[test]
  fn test_load_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskq.yaml");
    std::fs::write(&path, "storage:\n  path: /tmp/s.db\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.storage_path().unwrap(), PathBuf::from("/tmp/s.db"));
  }
}
