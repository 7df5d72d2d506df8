use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{
  CacheStorage, DynReportCache, NoopStorage, ReportCache, SqliteStorage, DEFAULT_RETENTION_DAYS,
};
use crate::schema::ReportSchema;

/// Environment variable that overrides `database_path`.
pub const DB_PATH_ENV: &str = "RCACHE_DB_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// SQLite file (defaults to $XDG_DATA_HOME/rcache/cache.db)
  pub database_path: Option<PathBuf>,
  /// Directory for log files (defaults to $XDG_DATA_HOME/rcache/logs)
  pub log_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub fetch: FetchConfig,
  #[serde(default)]
  pub reports: Vec<ReportConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, nothing is stored and every lookup misses
  pub enabled: bool,
  /// Age after which a cached report is re-fetched
  pub max_age_hours: i64,
  /// Age after which `clear` removes a cached report
  pub retention_days: i64,
  pub history_limit: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_age_hours: 24,
      retention_days: DEFAULT_RETENTION_DAYS,
      history_limit: 20,
    }
  }
}

impl CacheConfig {
  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::try_hours(self.max_age_hours).unwrap_or(chrono::Duration::MAX)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub timeout_secs: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

/// A report fetched from a remote source.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
  pub id: String,
  pub label: String,
  /// Endpoint returning the rows as a JSON array of objects
  pub url: Url,
  pub schema: Option<ReportSchema>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rcache/config.yaml
  ///
  /// Defaults apply when no file is found.
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
    let local = PathBuf::from("rcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rcache").join("config.yaml");
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

  /// Parse and check a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.check()?;
    Ok(config)
  }

  fn check(&self) -> Result<()> {
    let mut seen = BTreeSet::new();
    for report in &self.reports {
      if !seen.insert(report.id.as_str()) {
        return Err(eyre!("Duplicate report id '{}'", report.id));
      }
    }
    if self.cache.max_age_hours <= 0 {
      return Err(eyre!("cache.max_age_hours must be positive"));
    }
    Ok(())
  }

  /// Resolve the database path.
  ///
  /// Checks RCACHE_DB_PATH first, then the config file, then the default location.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(DB_PATH_ENV) {
      return Ok(PathBuf::from(path));
    }
    match &self.database_path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Resolve the log directory.
  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(
        SqliteStorage::default_path()?
          .parent()
          .map(|p| p.join("logs"))
          .unwrap_or_else(|| PathBuf::from("logs")),
      ),
    }
  }

  /// Open the report cache this configuration describes.
  pub fn open_cache(&self) -> Result<DynReportCache> {
    let storage: std::sync::Arc<dyn CacheStorage> = if self.cache.enabled {
      std::sync::Arc::new(SqliteStorage::open(self.database_path()?)?)
    } else {
      std::sync::Arc::new(NoopStorage)
    };
    Ok(ReportCache::from_shared(storage))
  }

  pub fn report(&self, id: &str) -> Option<&ReportConfig> {
    self.reports.iter().find(|r| r.id == id)
  }
}
