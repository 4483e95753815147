use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use casesync::cache::StalePolicy;
use casesync::compliance::PollIntervals;
use casesync::push::Backoff;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// REST base URL, e.g. https://compliance.example.com/api/v1
  pub base_url: String,
  /// Push socket URL (defaults to `<base_url>/events` over ws/wss)
  pub push_url: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Freshness window for domains without an override
  pub stale_secs: u64,
  /// Per-domain overrides, keyed by domain name (`applicants`, `jobs`, ...)
  pub stale: BTreeMap<String, u64>,
  pub job_poll_secs: u64,
  pub document_poll_secs: u64,
  pub reconnect_base_ms: u64,
  pub reconnect_max_attempts: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_secs: 30,
      stale: BTreeMap::new(),
      job_poll_secs: 2,
      document_poll_secs: 5,
      reconnect_base_ms: 1000,
      reconnect_max_attempts: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Keep last-known results on disk for warm starts
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { persist: true }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./casesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/casesync/config.yaml
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
        "No configuration file found. Create one at ~/.config/casesync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("casesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("casesync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url).map_err(|e| eyre!("Invalid api.base_url: {}", e))
  }

  /// The push endpoint. Derived from the base URL when not configured.
  pub fn push_url(&self) -> Result<Url> {
    if let Some(push) = &self.api.push_url {
      return Url::parse(push).map_err(|e| eyre!("Invalid api.push_url: {}", e));
    }
    let mut url = self.base_url()?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url
      .set_scheme(scheme)
      .map_err(|_| eyre!("Cannot derive push URL from {}", self.api.base_url))?;
    let path = format!("{}/events", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn stale_policy(&self) -> StalePolicy {
    let seconds = |s: u64| chrono::Duration::seconds(s as i64);
    self
      .sync
      .stale
      .iter()
      .fold(StalePolicy::new(seconds(self.sync.stale_secs)), |policy, (domain, s)| {
        policy.with_domain(domain, seconds(*s))
      })
  }

  pub fn poll_intervals(&self) -> PollIntervals {
    PollIntervals {
      jobs: Duration::from_secs(self.sync.job_poll_secs),
      documents: Duration::from_secs(self.sync.document_poll_secs),
    }
  }

  pub fn backoff(&self) -> Backoff {
    Backoff::new(
      Duration::from_millis(self.sync.reconnect_base_ms),
      self.sync.reconnect_max_attempts,
    )
  }
}
