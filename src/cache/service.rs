//! Caller-facing report cache.
//!
//! Wraps a [`CacheStorage`] backend and turns every storage fault into a
//! benign return value plus an error log line, so cache trouble never
//! cascades into the fetch or read paths of the caller.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use tracing::{debug, error, info};

use super::storage::{CacheStorage, SqliteStorage};
use super::types::{
  AccessRecord, AccessStats, CacheSource, FailureStats, LogSweep, ReportCacheEntry, ReportSummary,
  Row, UpdateHistoryRecord, UserQuery, ValidationStatus,
};

/// Default freshness window used by collaborators.
pub fn default_max_age() -> Duration {
  Duration::hours(24)
}

/// Default age in days after which `clear_old_cache` removes an entry.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Default number of history records returned.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Number of recent failures considered by [`ReportCache::failure_stats`].
const FAILURE_STATS_SAMPLE: usize = 1000;

/// Number of recent accesses considered by [`ReportCache::access_stats`].
const ACCESS_STATS_SAMPLE: usize = 5000;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    if let Ok(mut guard) = self.now.lock() {
      *guard = now;
    }
  }

  pub fn advance(&self, by: Duration) {
    if let Ok(mut guard) = self.now.lock() {
      *guard += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    match self.now.lock() {
      Ok(guard) => *guard,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
  fn now(&self) -> DateTime<Utc> {
    (**self).now()
  }
}

/// Durable report cache with freshness tracking and an update-history ledger.
///
/// Constructed once at startup and handed to whoever needs it; clones share
/// the same backend.
pub struct ReportCache<S: CacheStorage + ?Sized> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
}

/// A report cache whose backend is chosen at runtime.
pub type DynReportCache = ReportCache<dyn CacheStorage>;

impl ReportCache<SqliteStorage> {
  /// Open (or create) the SQLite-backed cache at `path`.
  ///
  /// Failing to create the schema is fatal: the error is returned and the
  /// caller must not start serving.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::new(SqliteStorage::open(path)?))
  }
}

impl<S: CacheStorage> ReportCache<S> {
  /// Create a new cache over the given storage backend.
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }
}

impl<S: CacheStorage + ?Sized> ReportCache<S> {
  /// Create a new cache over an already shared backend.
  pub fn from_shared(storage: Arc<S>) -> Self {
    Self {
      storage,
      clock: Arc::new(SystemClock),
    }
  }

  /// Replace the clock used for timestamps and freshness checks.
  pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Where the backing store lives, if anywhere.
  pub fn database_path(&self) -> Option<&Path> {
    self.storage.location()
  }

  /// Upsert the snapshot for `report_id` and record a successful update.
  ///
  /// Both writes happen in one transaction. Returns `false` when the cache
  /// was not updated; callers should keep serving what they had.
  pub fn save_report_cache(
    &self,
    report_id: &str,
    label: &str,
    data: Vec<Row>,
    validation_status: Option<ValidationStatus>,
  ) -> bool {
    let entry = ReportCacheEntry::new(report_id, label, data, self.now(), validation_status);

    match self.storage.save_report(&entry) {
      Ok(()) => {
        info!(report_id, label, rows = entry.row_count, "report cache saved");
        true
      }
      Err(e) => {
        error!(report_id, error = %e, "failed to save report cache");
        false
      }
    }
  }

  /// Record a failed fetch attempt without touching the cached snapshot.
  pub fn record_failure(&self, report_id: &str, error_message: &str) -> bool {
    let record = UpdateHistoryRecord::failure(report_id, self.now(), error_message);

    match self.storage.append_history(&record) {
      Ok(()) => true,
      Err(e) => {
        error!(report_id, error = %e, "failed to record update failure");
        false
      }
    }
  }

  /// Look up the cached snapshot for `report_id`.
  pub fn get_report_cache(&self, report_id: &str) -> Option<ReportCacheEntry> {
    self.storage.get_report(report_id).unwrap_or_else(|e| {
      error!(report_id, error = %e, "failed to read report cache");
      None
    })
  }

  /// Whether a snapshot exists and is younger than `max_age`.
  pub fn is_cache_fresh(&self, report_id: &str, max_age: Duration) -> bool {
    let last_update = match self.storage.get_last_update(report_id) {
      Ok(Some(last_update)) => last_update,
      Ok(None) => return false,
      Err(e) => {
        error!(report_id, error = %e, "failed to check cache freshness");
        return false;
      }
    };

    let fresh = self.now() - last_update < max_age;
    debug!(report_id, fresh, %last_update, "cache freshness checked");
    fresh
  }

  /// All cached reports, most recently updated first.
  pub fn list_cached_reports(&self) -> Vec<ReportSummary> {
    self.storage.list_reports().unwrap_or_else(|e| {
      error!(error = %e, "failed to list cached reports");
      Vec::new()
    })
  }

  /// Update history, newest first, optionally filtered to one report.
  pub fn get_update_history(
    &self,
    report_id: Option<&str>,
    limit: usize,
  ) -> Vec<UpdateHistoryRecord> {
    if limit == 0 {
      return Vec::new();
    }

    self
      .storage
      .history(report_id, limit)
      .unwrap_or_else(|e| {
        error!(?report_id, error = %e, "failed to read update history");
        Vec::new()
      })
  }

  /// Record a user query for analytics. Never fails from the caller's view.
  pub fn log_user_query(&self, query: &str, report_id: Option<&str>, result_count: Option<i64>) {
    let entry = UserQuery {
      query: query.to_string(),
      report_id: report_id.map(String::from),
      timestamp: self.now(),
      result_count,
    };

    if let Err(e) = self.storage.log_query(&entry) {
      error!(error = %e, "failed to log user query");
    }
  }

  /// Logged user queries, newest first.
  pub fn get_recent_queries(&self, limit: usize) -> Vec<UserQuery> {
    self.storage.recent_queries(limit).unwrap_or_else(|e| {
      error!(error = %e, "failed to read user queries");
      Vec::new()
    })
  }

  /// Remove every entry last updated more than `days_old` days ago.
  ///
  /// History records are kept. Returns how many entries were removed.
  pub fn clear_old_cache(&self, days_old: i64) -> usize {
    let Some(cutoff) = self.days_ago(days_old) else {
      error!(days_old, "retention window out of range");
      return 0;
    };

    match self.storage.delete_older_than(cutoff) {
      Ok(deleted) => {
        if deleted > 0 {
          info!(deleted, days_old, "removed old cache entries");
        }
        deleted
      }
      Err(e) => {
        error!(days_old, error = %e, "failed to clear old cache");
        0
      }
    }
  }

  /// Delete one cached report. History is kept.
  pub fn delete_report_cache(&self, report_id: &str) -> bool {
    match self.storage.delete_report(report_id) {
      Ok(deleted) => {
        if deleted {
          info!(report_id, "report cache deleted");
        }
        deleted
      }
      Err(e) => {
        error!(report_id, error = %e, "failed to delete report cache");
        false
      }
    }
  }

  /// Failed attempts, newest first, optionally filtered to one report.
  pub fn get_failures(&self, report_id: Option<&str>, limit: usize) -> Vec<UpdateHistoryRecord> {
    self.storage.failures(report_id, limit).unwrap_or_else(|e| {
      error!(?report_id, error = %e, "failed to read failed updates");
      Vec::new()
    })
  }

  /// Aggregate recent failed attempts, counting those newer than `window`.
  pub fn failure_stats(&self, window: Duration) -> FailureStats {
    let failures = match self.storage.failures(None, FAILURE_STATS_SAMPLE) {
      Ok(failures) => failures,
      Err(e) => {
        error!(error = %e, "failed to read failed updates");
        return FailureStats::default();
      }
    };

    let since = self.now() - window;
    let mut stats = FailureStats {
      total: failures.len(),
      last_failure: failures.first().map(|f| f.timestamp),
      ..FailureStats::default()
    };

    for failure in &failures {
      *stats.by_report.entry(failure.report_id.clone()).or_default() += 1;
      let reason = failure.error_message.clone().unwrap_or_default();
      *stats.by_reason.entry(reason).or_default() += 1;
      if failure.timestamp > since {
        stats.in_window += 1;
      }
    }

    stats
  }

  /// Record that `report_id` was served from `source` after `latency`.
  pub fn log_access(
    &self,
    report_id: &str,
    source: CacheSource,
    latency: std::time::Duration,
  ) -> bool {
    let access = AccessRecord {
      report_id: report_id.to_string(),
      source,
      latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
      timestamp: self.now(),
    };

    match self.storage.log_access(&access) {
      Ok(()) => true,
      Err(e) => {
        error!(report_id, error = %e, "failed to log access");
        false
      }
    }
  }

  /// Served reports, newest first, optionally filtered to one report.
  pub fn get_accesses(&self, report_id: Option<&str>, limit: usize) -> Vec<AccessRecord> {
    self.storage.accesses(report_id, limit).unwrap_or_else(|e| {
      error!(?report_id, error = %e, "failed to read access log");
      Vec::new()
    })
  }

  /// Aggregate recent accesses, counting those newer than `window`.
  pub fn access_stats(&self, window: Duration) -> AccessStats {
    let accesses = match self.storage.accesses(None, ACCESS_STATS_SAMPLE) {
      Ok(accesses) => accesses,
      Err(e) => {
        error!(error = %e, "failed to read access log");
        return AccessStats::default();
      }
    };
    if accesses.is_empty() {
      return AccessStats::default();
    }

    let since = self.now() - window;
    let mut stats = AccessStats {
      total: accesses.len(),
      ..AccessStats::default()
    };
    let mut total_latency = 0u64;

    for access in &accesses {
      *stats
        .by_source
        .entry(access.source.as_str().to_string())
        .or_default() += 1;
      *stats.by_report.entry(access.report_id.clone()).or_default() += 1;
      total_latency = total_latency.saturating_add(access.latency_ms);
      if access.timestamp > since {
        stats.in_window += 1;
      }
    }
    stats.avg_latency_ms = total_latency as f64 / accesses.len() as f64;

    stats
  }

  /// Prune user queries and accesses older than `days_old` days.
  ///
  /// The update history is an audit trail and is never pruned.
  pub fn clear_old_logs(&self, days_old: i64) -> LogSweep {
    let Some(cutoff) = self.days_ago(days_old) else {
      error!(days_old, "retention window out of range");
      return LogSweep::default();
    };

    match self.storage.delete_logs_older_than(cutoff) {
      Ok(sweep) => {
        if sweep != LogSweep::default() {
          info!(
            queries = sweep.queries,
            accesses = sweep.accesses,
            days_old,
            "removed old log entries"
          );
        }
        sweep
      }
      Err(e) => {
        error!(days_old, error = %e, "failed to clear old logs");
        LogSweep::default()
      }
    }
  }

  fn days_ago(&self, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|age| self.now().checked_sub_signed(age))
  }
}

impl<S: CacheStorage + ?Sized> Clone for ReportCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
    }
  }
}
