use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::artifact::CachePolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub pagination: PaginationConfig,
  pub persistence: PersistenceConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// GC sweeps a record must stay unreachable for before it is evicted
  pub gc_buffer_size: usize,
  /// Age after which cached fields count as stale
  pub stale_after_secs: Option<u64>,
  pub default_policy: CachePolicy,
  /// Key fields per type name; types not listed are keyed by `id`
  #[serde(deserialize_with = "deserialize_key_fields")]
  pub keys: BTreeMap<String, Vec<String>>,
  /// Concrete types implementing each abstract type
  pub possible_types: BTreeMap<String, BTreeSet<String>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      gc_buffer_size: 10,
      stale_after_secs: None,
      default_policy: CachePolicy::CacheFirst,
      keys: BTreeMap::new(),
      possible_types: BTreeMap::new(),
    }
  }
}

impl CacheConfig {
  pub fn keys_for(&self, type_name: &str) -> Vec<&str> {
    match self.keys.get(type_name) {
      Some(keys) => keys.iter().map(String::as_str).collect(),
      None => vec!["id"],
    }
  }

  pub fn stale_after(&self) -> Option<chrono::Duration> {
    self
      .stale_after_secs
      .and_then(|secs| chrono::Duration::try_seconds(secs as i64))
  }
}

/// Rejects empty key lists: a keyed type must have at least one key field.
fn deserialize_key_fields<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let keys: BTreeMap<String, Vec<String>> = BTreeMap::deserialize(deserializer)?;
  if let Some((type_name, _)) = keys.iter().find(|(_, fields)| fields.is_empty()) {
    return Err(serde::de::Error::custom(format!(
      "type {} needs at least one key field",
      type_name
    )));
  }
  Ok(keys)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
  pub default_page_size: usize,
}

impl Default for PaginationConfig {
  fn default() -> Self {
    Self {
      default_page_size: 10,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  /// SQLite snapshot file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

impl PersistenceConfig {
  pub fn resolved_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("gqlstore").join("cache.db"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// `tracing` filter directives; `RUST_LOG` wins when set
  pub filter: String,
  /// Write daily-rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
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
  /// 2. ./gqlstore.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gqlstore/config.yaml
  ///
  /// Without a file the defaults are used.
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
    let local = PathBuf::from("gqlstore.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gqlstore").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }
}
