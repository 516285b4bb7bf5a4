use color_eyre::{eyre::eyre, Result};
use retina_offline::artifacts::ArtifactCacheConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `sync.api_url`.
pub const API_URL_ENV: &str = "RETINA_API_URL";

const APP_DIR: &str = "retina-offline";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub artifacts: ArtifactCacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub intercept: InterceptConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// Database file (defaults to $XDG_DATA_HOME/retina-offline/offline.db)
  pub path: Option<PathBuf>,
  /// Synced records older than this are removed by `sweep`
  #[serde(default = "default_retention_days")]
  pub retention_days: u32,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      retention_days: default_retention_days(),
    }
  }
}

fn default_retention_days() -> u32 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Backend base URL, e.g. http://localhost:8000
  #[serde(default = "default_api_url")]
  pub api_url: String,
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
      interval_secs: default_interval_secs(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

fn default_api_url() -> String {
  "http://localhost:8000".to_string()
}

fn default_interval_secs() -> u64 {
  300
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterceptConfig {
  /// Origin the app is served from; other origins are cross-origin
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Bump to invalidate every cache on the next activation
  #[serde(default = "default_cache_version")]
  pub cache_version: u32,
  /// Assets stored at install time
  #[serde(default)]
  pub precache: Vec<String>,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache_prefix: default_cache_prefix(),
      cache_version: default_cache_version(),
      precache: Vec::new(),
    }
  }
}

fn default_origin() -> String {
  "http://localhost:3000".to_string()
}

fn default_cache_prefix() -> String {
  "retina".to_string()
}

fn default_cache_version() -> u32 {
  1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Log directory (defaults to $XDG_DATA_HOME/retina-offline/logs)
  pub directory: Option<PathBuf>,
  /// Filter used when RUST_LOG is unset
  pub level: Option<String>,
}

impl Config {
  /// Load configuration from file, falling back to defaults when none exists.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./retina-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/retina-offline/config.yaml
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.apply_env(std::env::var(API_URL_ENV).ok());
    config
      .artifacts
      .validate()
      .map_err(|e| eyre!("Invalid artifacts section: {}", e))?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("retina-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file deserializes to unit, not an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  fn apply_env(&mut self, api_url: Option<String>) {
    if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
      self.sync.api_url = url;
    }
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(p) => Ok(p.clone()),
      None => retina_offline::store::SqliteStore::default_path()
        .map_err(|e| eyre!("{}; set store.path in the config file", e)),
    }
  }

  pub fn log_directory(&self) -> Option<PathBuf> {
    self
      .logging
      .directory
      .clone()
      .or_else(|| dirs::data_dir().map(|d| d.join(APP_DIR).join("logs")))
  }
}
