use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use url::Url;

use crate::api::EntityKind;
use crate::sync::{DEFAULT_SPLIT_THRESHOLD, DEFAULT_SYNCING_STALE_SECS};

/// Upper bound for TTLs and the staleness window: ten years.
const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub reachability: ReachabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Database location (defaults to $XDG_DATA_HOME/tether/cache.db)
  pub path: Option<PathBuf>,
  #[serde(default)]
  pub ttl: TtlConfig,
}

/// Time-to-live per entity kind, in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TtlConfig {
  #[serde(default = "default_profile_ttl")]
  pub profile_secs: i64,
  #[serde(default = "default_notes_ttl")]
  pub notes_secs: i64,
  #[serde(default = "default_locations_ttl")]
  pub locations_secs: i64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      profile_secs: default_profile_ttl(),
      notes_secs: default_notes_ttl(),
      locations_secs: default_locations_ttl(),
    }
  }
}

impl TtlConfig {
  pub fn for_kind(&self, kind: EntityKind) -> chrono::Duration {
    let secs = match kind {
      EntityKind::Profile => self.profile_secs,
      EntityKind::Notes => self.notes_secs,
      EntityKind::Locations => self.locations_secs,
    };
    chrono::Duration::seconds(secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Deliveries in flight per drain
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,
  /// Bulk batches larger than this are bisected on a 400
  #[serde(default = "default_split_threshold")]
  pub split_threshold: usize,
  #[serde(default = "default_syncing_stale_secs")]
  pub syncing_stale_secs: i64,
  /// Period of the `run` loop
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      concurrency: default_concurrency(),
      split_threshold: default_split_threshold(),
      syncing_stale_secs: default_syncing_stale_secs(),
      interval_secs: default_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReachabilityConfig {
  /// `host:port` to probe; derived from `remote.base_url` when unset
  pub probe: Option<String>,
  #[serde(default = "default_probe_timeout_ms")]
  pub timeout_ms: u64,
}

impl Default for ReachabilityConfig {
  fn default() -> Self {
    Self {
      probe: None,
      timeout_ms: default_probe_timeout_ms(),
    }
  }
}

impl ReachabilityConfig {
  pub fn timeout(&self) -> StdDuration {
    StdDuration::from_millis(self.timeout_ms)
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_profile_ttl() -> i64 {
  3600
}

fn default_notes_ttl() -> i64 {
  300
}

fn default_locations_ttl() -> i64 {
  86400
}

fn default_concurrency() -> usize {
  4
}

fn default_split_threshold() -> usize {
  DEFAULT_SPLIT_THRESHOLD
}

fn default_syncing_stale_secs() -> i64 {
  DEFAULT_SYNCING_STALE_SECS
}

fn default_interval_secs() -> u64 {
  60
}

fn default_probe_timeout_ms() -> u64 {
  1500
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tether.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tether/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tether/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tether.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tether").join("config.yaml");
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

  /// Parse and validate YAML configuration.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    Url::parse(&self.remote.base_url)
      .map_err(|e| eyre!("remote.base_url is not a valid URL: {}", e))?;
    if self.sync.split_threshold == 0 {
      return Err(eyre!("sync.split_threshold must be at least 1"));
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be at least 1"));
    }

    let windows = [
      ("cache.ttl.profile_secs", self.cache.ttl.profile_secs),
      ("cache.ttl.notes_secs", self.cache.ttl.notes_secs),
      ("cache.ttl.locations_secs", self.cache.ttl.locations_secs),
      ("sync.syncing_stale_secs", self.sync.syncing_stale_secs),
    ];
    for (name, secs) in windows {
      if !(1..=MAX_WINDOW_SECS).contains(&secs) {
        return Err(eyre!(
          "{} must be between 1 and {} seconds, got {}",
          name,
          MAX_WINDOW_SECS,
          secs
        ));
      }
    }
    Ok(())
  }

  /// Database location, honouring `cache.path`.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => Ok(crate::db::default_path()?),
    }
  }

  /// `host:port` the reachability probe connects to.
  pub fn probe_target(&self) -> Result<String> {
    if let Some(probe) = &self.reachability.probe {
      return Ok(probe.clone());
    }

    let url = Url::parse(&self.remote.base_url)?;
    let host = url
      .host_str()
      .ok_or_else(|| eyre!("remote.base_url has no host"))?;
    let port = url
      .port_or_known_default()
      .ok_or_else(|| eyre!("remote.base_url has no known port"))?;
    Ok(format!("{}:{}", host, port))
  }

  /// Get the API token from environment variables.
  ///
  /// Reads TETHER_API_TOKEN; absent means unauthenticated requests.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TETHER_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
