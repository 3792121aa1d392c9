use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Address the proxy listens on
  pub listen: SocketAddr,
  /// Origin of the application being fronted
  pub upstream: Url,
  /// Build identifier; cache namespaces are versioned by it
  pub version: String,
  pub cache: CacheConfig,
  pub routing: RoutingConfig,
  pub queue: QueueConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub lifecycle: LifecycleConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
      upstream: Url::parse("http://127.0.0.1:3000/").expect("static URL is valid"),
      version: "v1".to_string(),
      cache: CacheConfig::default(),
      routing: RoutingConfig::default(),
      queue: QueueConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      lifecycle: LifecycleConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReadDiscipline {
  /// Serve from cache immediately, refresh in the background
  #[default]
  StaleWhileRevalidate,
  /// Always try the network, fall back to cache when it fails
  NetworkFirst,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, nothing is cached and reads always go to the network
  pub enabled: bool,
  /// Prefix for namespace names, e.g. "data-logger" -> "data-logger-runtime-v1"
  pub prefix: String,
  pub strategy: ReadDiscipline,
  /// Paths fetched into the precache namespace at install
  pub precache: Vec<String>,
  /// Path served from cache when a read misses and the network is down
  pub offline_fallback: Option<String>,
  /// Database file; defaults to the user data directory
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      prefix: "offline-relay".to_string(),
      strategy: ReadDiscipline::default(),
      precache: vec!["/".to_string()],
      offline_fallback: Some("/".to_string()),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Path prefixes that always bypass the cache
  pub fresh_data_prefixes: Vec<String>,
  /// Exact paths that accept form submissions
  pub write_endpoints: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      fresh_data_prefixes: vec!["/api/".to_string()],
      // The index route posts to `/?index`; data requests go to `/_root.data`.
      write_endpoints: vec!["/".to_string(), "/_root.data".to_string()],
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DrainPolicy {
  /// Delete each record right after it replays; failures stay queued
  #[default]
  RetainFailed,
  /// Delete every record of a pass once the pass ends, delivered or not
  DropFailed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Form field that must be present for a failed write to be queued
  pub field: String,
  pub policy: DrainPolicy,
  /// Database file; defaults to the user data directory
  pub database: Option<PathBuf>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      field: "fieldValue".to_string(),
      policy: DrainPolicy::default(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag of the deferred-sync registration
  pub tag: String,
  /// Seconds between reachability checks while a sync is pending
  pub check_interval_secs: u64,
  /// Failed sync attempts before a registration is dropped
  pub max_attempts: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-logs".to_string(),
      check_interval_secs: 30,
      max_attempts: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      connect_timeout_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub skip_waiting: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Directive used when RUST_LOG is unset (defaults to "info")
  pub filter: Option<String>,
  /// Directory for the rolling log file; defaults to the user data directory
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-relay/config.yaml
  ///
  /// Without any file the defaults are used.
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
    let local = PathBuf::from("offline-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if !matches!(self.upstream.scheme(), "http" | "https") {
      return Err(eyre!("upstream must be an http(s) URL, got {}", self.upstream));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.queue.field.is_empty() {
      return Err(eyre!("queue.field must not be empty"));
    }
    for endpoint in &self.routing.write_endpoints {
      if !endpoint.starts_with('/') {
        return Err(eyre!("write endpoint must be an absolute path: {}", endpoint));
      }
    }
    Ok(())
  }
}
