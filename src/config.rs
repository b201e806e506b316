use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::FetchOptions;
use crate::query::QueryConfig;
use crate::sw::Strategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Version tag appended to every bucket name; bump it to drop old buckets
  pub cache_version: String,
  /// Origin the precache list and navigation fallback are resolved against
  pub origin: Option<String>,
  /// Static resources fetched at install time (paths, not content)
  pub precache: Vec<String>,
  /// Path of the root document served to offline navigations
  pub navigation_fallback: String,
  /// Path prefix identifying API requests
  pub api_prefix: String,
  /// SQLite file (defaults to $XDG_DATA_HOME/tiercache/cache.db)
  pub database: Option<PathBuf>,
  pub network_timeout_secs: u64,
  pub routes: RoutesConfig,
  pub request_cache: RequestCacheConfig,
  pub query: QueryDefaults,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_version: "v1".to_string(),
      origin: None,
      precache: vec!["/".to_string()],
      navigation_fallback: "/".to_string(),
      api_prefix: "/api/".to_string(),
      database: None,
      network_timeout_secs: 30,
      routes: RoutesConfig::default(),
      request_cache: RequestCacheConfig::default(),
      query: QueryDefaults::default(),
      log: LogConfig::default(),
    }
  }
}

/// Per-class overrides of the built-in route table. Unset fields keep the
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  pub navigation: RouteOverride,
  pub asset: RouteOverride,
  pub image: RouteOverride,
  pub font: RouteOverride,
  pub api: RouteOverride,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteOverride {
  pub strategy: Option<Strategy>,
  pub max_entries: Option<usize>,
  pub max_age_secs: Option<u64>,
  /// Statuses eligible for storage
  pub statuses: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestCacheConfig {
  pub max_age_ms: u64,
  pub stale_while_revalidate: bool,
}

impl Default for RequestCacheConfig {
  fn default() -> Self {
    Self {
      max_age_ms: 5 * 60 * 1000,
      stale_while_revalidate: true,
    }
  }
}

impl RequestCacheConfig {
  pub fn fetch_options(&self) -> FetchOptions {
    FetchOptions {
      max_age: Duration::from_millis(self.max_age_ms),
      stale_while_revalidate: self.stale_while_revalidate,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
  pub retry: u32,
  pub retry_delay_ms: u64,
  pub refetch_interval_ms: Option<u64>,
}

impl Default for QueryDefaults {
  fn default() -> Self {
    Self {
      retry: 3,
      retry_delay_ms: 1000,
      refetch_interval_ms: None,
    }
  }
}

impl QueryDefaults {
  pub fn query_config(&self, fetch: FetchOptions) -> QueryConfig {
    QueryConfig {
      enabled: true,
      retry: self.retry,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
      refetch_interval: self.refetch_interval_ms.map(Duration::from_millis),
      fetch,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when TIERCACHE_LOG is not set
  pub level: String,
  /// Directory for the daily log file (defaults to the data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tiercache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tiercache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from("tiercache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tiercache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache_version.trim().is_empty() {
      return Err(eyre!("cache_version must not be empty"));
    }
    Ok(config)
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_fields_missing() {
    let config = Config::from_yaml("cache_version: v7\n").unwrap();
    assert_eq!(config.cache_version, "v7");
    assert_eq!(config.api_prefix, "/api/");
    assert!(config.request_cache.stale_while_revalidate);
    assert_eq!(config.query.retry, 3);
  }

  #[test]
  fn test_route_overrides_parse() {
    let yaml = r#"
cache_version: v2
origin: https://shop.example.com
precache: ["/", "/index.html", "/manifest.json"]
routes:
  api:
    strategy: network_first
    max_age_secs: 60
  image:
    max_entries: 5
    statuses: [200, 203]
query:
  retry: 1
  retry_delay_ms: 250
  refetch_interval_ms: 30000
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.precache.len(), 3);
    assert_eq!(config.routes.api.strategy, Some(Strategy::NetworkFirst));
    assert_eq!(config.routes.api.max_age_secs, Some(60));
    assert_eq!(config.routes.image.statuses, Some(vec![200, 203]));

    let query = config.query.query_config(config.request_cache.fetch_options());
    assert_eq!(query.retry, 1);
    assert_eq!(query.retry_delay, Duration::from_millis(250));
    assert_eq!(query.refetch_interval, Some(Duration::from_secs(30)));
  }

  #[test]
  fn test_rejects_empty_version() {
    assert!(Config::from_yaml("cache_version: \"\"\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
