use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base URL used when neither config nor environment provide a valid one.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub store: StoreConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// API base URL (falls back to NEOFORGE_API_URL, then the built-in default)
  pub base_url: Option<String>,
  /// Retries after the first attempt for 429 and retryable 5xx responses
  pub max_retries: u32,
  pub base_delay_ms: u64,
  /// Upper bound for a single backoff delay
  pub max_delay_ms: u64,
  /// Default timeout for `request_with_timeout`
  pub timeout_ms: u64,
  /// How long plain GET responses are kept for offline fallback
  pub offline_ttl_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      max_retries: 3,
      base_delay_ms: 1000,
      max_delay_ms: 60_000,
      timeout_ms: 30_000,
      offline_ttl_secs: 24 * 60 * 60,
    }
  }
}

impl ApiConfig {
  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }

  pub fn max_delay(&self) -> Duration {
    Duration::from_millis(self.max_delay_ms)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn offline_ttl(&self) -> Duration {
    Duration::from_secs(self.offline_ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/neoforge/neoforge-offline.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Root state slices written to the cache after every change
  pub persist_keys: Vec<String>,
  /// Cache key holding the persisted slices
  pub persist_key: String,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      persist_keys: Vec::new(),
      persist_key: "app_state".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// EnvFilter directive used when RUST_LOG is unset
  pub filter: String,
  /// Log directory (default: $XDG_DATA_HOME/neoforge/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./neoforge.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/neoforge/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
    let local = PathBuf::from("neoforge.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("neoforge").join("config.yaml");
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
    Ok(config)
  }

  /// Get the API token from the environment.
  ///
  /// Checks NEOFORGE_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("NEOFORGE_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Get the API base URL override from the environment.
  pub fn get_api_url() -> Option<String> {
    std::env::var("NEOFORGE_API_URL").ok()
  }
}
