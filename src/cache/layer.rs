//! Cache layer that orchestrates caching logic with remote fetching.

use std::future::Future;
use std::time::Instant;

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, warn};

use super::service::{default_max_age, ReportCache};
use super::storage::CacheStorage;
use super::types::{CacheResult, CacheSource, ReportCacheEntry, Row, ValidationStatus};

/// Rows of a report plus the schema check made when they were fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportData {
  pub data: Vec<Row>,
  pub validation_status: Option<ValidationStatus>,
}

impl From<ReportCacheEntry> for ReportData {
  fn from(entry: ReportCacheEntry) -> Self {
    Self {
      data: entry.data,
      validation_status: entry.validation_status,
    }
  }
}

/// Cache layer that manages caching logic and remote fetching.
///
/// This layer sits between the application and a report source,
/// providing transparent caching with offline support. The cache itself
/// is blocking, so every storage call runs on tokio's blocking pool.
pub struct CacheLayer<S: CacheStorage + ?Sized> {
  cache: ReportCache<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage + ?Sized + 'static> CacheLayer<S> {
  /// Create a new cache layer over the given cache.
  pub fn new(cache: ReportCache<S>) -> Self {
    Self {
      cache,
      stale_time: default_max_age(),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn stale_time(&self) -> Duration {
    self.stale_time
  }

  pub fn cache(&self) -> &ReportCache<S> {
    &self.cache
  }

  /// Run a cache operation on the blocking pool.
  pub async fn blocking<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&ReportCache<S>) -> T + Send + 'static,
    T: Send + 'static,
  {
    let cache = self.cache.clone();
    tokio::task::spawn_blocking(move || f(&cache))
      .await
      .map_err(|e| eyre!("Cache task failed: {}", e))
  }

  /// Whether every one of `report_ids` is cached and fresh.
  pub async fn all_fresh(&self, report_ids: Vec<String>) -> Result<bool> {
    let stale_time = self.stale_time;
    self
      .blocking(move |cache| {
        report_ids
          .iter()
          .all(|id| cache.is_cache_fresh(id, stale_time))
      })
      .await
  }

  /// Read a report straight from the cache, regardless of age.
  pub async fn cached(&self, report_id: &str) -> Result<Option<ReportCacheEntry>> {
    let report_id = report_id.to_string();
    self
      .blocking(move |cache| cache.get_report_cache(&report_id))
      .await
  }

  /// Fetch a report with a cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from the source and save the result
  /// 3. On fetch failure, record the failure and return stale cache (offline mode)
  /// 4. With nothing cached, the fetch error is returned
  ///
  /// Every served report is recorded in the access log with its source and latency.
  pub async fn fetch_report<F, Fut>(
    &self,
    report_id: &str,
    label: &str,
    fetcher: F,
  ) -> Result<CacheResult<ReportData>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ReportData>>,
  {
    let started = Instant::now();
    let owned_id = report_id.to_string();
    let stale_time = self.stale_time;
    let fresh = self
      .blocking(move |cache| {
        let entry = if cache.is_cache_fresh(&owned_id, stale_time) {
          cache.get_report_cache(&owned_id)
        } else {
          None
        };
        if entry.is_some() {
          cache.log_access(&owned_id, CacheSource::CacheFresh, started.elapsed());
        }
        entry
      })
      .await?;

    if let Some(entry) = fresh {
      debug!(report_id, "serving fresh cache");
      let cached_at = entry.last_update;
      return Ok(CacheResult::from_cache(entry.into(), cached_at));
    }

    self.fetch_from_source(report_id, label, fetcher, started).await
  }

  /// Fetch a report from the source regardless of cache age.
  ///
  /// Saves on success; on failure records it and falls back to whatever is cached.
  pub async fn refresh_report<F, Fut>(
    &self,
    report_id: &str,
    label: &str,
    fetcher: F,
  ) -> Result<CacheResult<ReportData>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ReportData>>,
  {
    self
      .fetch_from_source(report_id, label, fetcher, Instant::now())
      .await
  }

  async fn fetch_from_source<F, Fut>(
    &self,
    report_id: &str,
    label: &str,
    fetcher: F,
    started: Instant,
  ) -> Result<CacheResult<ReportData>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ReportData>>,
  {
    match fetcher().await {
      Ok(report) => {
        let latency = started.elapsed();
        let (id, label, data, validation) = (
          report_id.to_string(),
          label.to_string(),
          report.data.clone(),
          report.validation_status.clone(),
        );
        // A failed save is already logged; the fresh rows are still served
        self
          .blocking(move |cache| {
            cache.save_report_cache(&id, &label, data, validation);
            cache.log_access(&id, CacheSource::Network, latency);
          })
          .await?;
        Ok(CacheResult::from_network(report))
      }
      Err(fetch_error) => {
        warn!(report_id, error = %fetch_error, "fetch failed, falling back to cache");
        let (id, message) = (report_id.to_string(), fetch_error.to_string());
        let stale = self
          .blocking(move |cache| {
            cache.record_failure(&id, &message);
            let stale = cache.get_report_cache(&id);
            if stale.is_some() {
              cache.log_access(&id, CacheSource::Offline, started.elapsed());
            }
            stale
          })
          .await?;

        match stale {
          Some(entry) => {
            let cached_at = entry.last_update;
            Ok(CacheResult::offline(entry.into(), cached_at))
          }
          None => Err(fetch_error),
        }
      }
    }
  }
}

impl<S: CacheStorage + ?Sized> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      stale_time: self.stale_time,
    }
  }
}
