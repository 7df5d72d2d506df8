//! Cache storage trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use super::types::{
  AccessRecord, CacheSource, LogSweep, ReportCacheEntry, ReportSummary, Row, UpdateHistoryRecord,
  UserQuery, ValidationStatus,
};

/// Trait for cache storage backends.
///
/// Every method reports storage faults as `Err`; turning those into benign
/// values is the job of [`ReportCache`](super::ReportCache).
pub trait CacheStorage: Send + Sync {
  /// Upsert a report snapshot and append a successful history record, atomically.
  fn save_report(&self, entry: &ReportCacheEntry) -> Result<()>;

  /// Get a cached report by id.
  fn get_report(&self, report_id: &str) -> Result<Option<ReportCacheEntry>>;

  /// Get only the last update time of a report, without loading its data.
  fn get_last_update(&self, report_id: &str) -> Result<Option<DateTime<Utc>>>;

  /// All cached reports, most recently updated first.
  fn list_reports(&self) -> Result<Vec<ReportSummary>>;

  /// Delete one report. Returns whether it existed.
  fn delete_report(&self, report_id: &str) -> Result<bool>;

  /// Delete every report last updated before `cutoff`. Returns the number removed.
  fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Append a record to the update history.
  fn append_history(&self, record: &UpdateHistoryRecord) -> Result<()>;

  /// Update history, newest first, optionally filtered by report.
  fn history(&self, report_id: Option<&str>, limit: usize) -> Result<Vec<UpdateHistoryRecord>>;

  /// Failed attempts only, newest first, optionally filtered by report.
  fn failures(&self, report_id: Option<&str>, limit: usize) -> Result<Vec<UpdateHistoryRecord>>;

  /// Append a user query to the analytics log.
  fn log_query(&self, query: &UserQuery) -> Result<()>;

  /// Logged user queries, newest first.
  fn recent_queries(&self, limit: usize) -> Result<Vec<UserQuery>>;

  /// Append a served report to the access log.
  fn log_access(&self, access: &AccessRecord) -> Result<()>;

  /// Access log, newest first, optionally filtered by report.
  fn accesses(&self, report_id: Option<&str>, limit: usize) -> Result<Vec<AccessRecord>>;

  /// Delete user queries and accesses logged before `cutoff`.
  ///
  /// The update history is never pruned.
  fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<LogSweep>;

  /// Location of the backing store, if there is one.
  fn location(&self) -> Option<&Path>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn save_report(&self, _entry: &ReportCacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_report(&self, _report_id: &str) -> Result<Option<ReportCacheEntry>> {
    Ok(None) // Always miss
  }

  fn get_last_update(&self, _report_id: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(None)
  }

  fn list_reports(&self) -> Result<Vec<ReportSummary>> {
    Ok(Vec::new())
  }

  fn delete_report(&self, _report_id: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn append_history(&self, _record: &UpdateHistoryRecord) -> Result<()> {
    Ok(())
  }

  fn history(&self, _report_id: Option<&str>, _limit: usize) -> Result<Vec<UpdateHistoryRecord>> {
    Ok(Vec::new())
  }

  fn failures(&self, _report_id: Option<&str>, _limit: usize) -> Result<Vec<UpdateHistoryRecord>> {
    Ok(Vec::new())
  }

  fn log_query(&self, _query: &UserQuery) -> Result<()> {
    Ok(())
  }

  fn recent_queries(&self, _limit: usize) -> Result<Vec<UserQuery>> {
    Ok(Vec::new())
  }

  fn log_access(&self, _access: &AccessRecord) -> Result<()> {
    Ok(())
  }

  fn accesses(&self, _report_id: Option<&str>, _limit: usize) -> Result<Vec<AccessRecord>> {
    Ok(Vec::new())
  }

  fn delete_logs_older_than(&self, _cutoff: DateTime<Utc>) -> Result<LogSweep> {
    Ok(LogSweep::default())
  }

  fn location(&self) -> Option<&Path> {
    None
  }
}

/// SQLite-based cache storage implementation.
///
/// Holds only the database path. Each operation opens its own connection and
/// drops it before returning, so the storage can be shared freely between
/// threads and cross-process writers are serialized by SQLite's file lock.
pub struct SqliteStorage {
  path: PathBuf,
}

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl SqliteStorage {
  /// Create a new SQLite storage at the given path, creating the schema if needed.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let storage = Self { path };
    storage.run_migrations()?;
    info!(path = %storage.path.display(), "cache database initialized");

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("rcache").join("cache.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn connect(&self) -> Result<Connection> {
    let conn = Connection::open(&self.path).map_err(|e| {
      eyre!(
        "Failed to open cache database at {}: {}",
        self.path.display(),
        e
      )
    })?;
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    Ok(conn)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.connect()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Latest snapshot per report (data and validation stored as JSON)
CREATE TABLE IF NOT EXISTS report_cache (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    data TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    last_update TEXT NOT NULL,
    validation_status TEXT
);

CREATE INDEX IF NOT EXISTS idx_report_cache_last_update
    ON report_cache(last_update);

-- Append-only log of fetch attempts, no cascade from report_cache
CREATE TABLE IF NOT EXISTS update_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_update_history_report
    ON update_history(report_id, timestamp);

-- Analytics sink for user queries
CREATE TABLE IF NOT EXISTS user_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    report_id TEXT,
    timestamp TEXT NOT NULL,
    result_count INTEGER
);

CREATE INDEX IF NOT EXISTS idx_user_queries_timestamp
    ON user_queries(timestamp);

-- Every report served, with where it came from
CREATE TABLE IF NOT EXISTS access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id TEXT NOT NULL,
    source TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_report
    ON access_log(report_id, timestamp);

CREATE INDEX IF NOT EXISTS idx_access_log_timestamp
    ON access_log(timestamp);
"#;

const INSERT_HISTORY: &str = "INSERT INTO update_history (report_id, timestamp, row_count, success, error_message)
   VALUES (?, ?, ?, ?, ?)";

impl CacheStorage for SqliteStorage {
  fn save_report(&self, entry: &ReportCacheEntry) -> Result<()> {
    let data =
      serde_json::to_string(&entry.data).map_err(|e| eyre!("Failed to serialize data: {}", e))?;
    let validation = entry
      .validation_status
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize validation status: {}", e))?;
    let timestamp = format_timestamp(entry.last_update);
    let row_count = entry.data.len() as i64;

    let mut conn = self.connect()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO report_cache (id, label, data, row_count, last_update, validation_status)
       VALUES (?, ?, ?, ?, ?, ?)
       ON CONFLICT(id) DO UPDATE SET
         label = excluded.label,
         data = excluded.data,
         row_count = excluded.row_count,
         last_update = excluded.last_update,
         validation_status = excluded.validation_status",
      params![entry.report_id, entry.label, data, row_count, timestamp, validation],
    )
    .map_err(|e| eyre!("Failed to upsert report cache: {}", e))?;

    tx.execute(
      INSERT_HISTORY,
      params![entry.report_id, timestamp, row_count, true, Option::<String>::None],
    )
    .map_err(|e| eyre!("Failed to record update history: {}", e))?;

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_report(&self, report_id: &str) -> Result<Option<ReportCacheEntry>> {
    let conn = self.connect()?;

    let row: Option<(String, String, String, Option<String>)> = conn
      .query_row(
        "SELECT label, data, last_update, validation_status
         FROM report_cache WHERE id = ?",
        params![report_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query report cache: {}", e))?;

    let Some((label, data, last_update, validation)) = row else {
      return Ok(None);
    };

    let data: Vec<Row> = serde_json::from_str(&data)
      .map_err(|e| eyre!("Failed to deserialize data for '{}': {}", report_id, e))?;

    Ok(Some(ReportCacheEntry::new(
      report_id,
      label,
      data,
      parse_timestamp(&last_update)?,
      parse_validation(validation)?,
    )))
  }

  fn get_last_update(&self, report_id: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self.connect()?;

    let last_update: Option<String> = conn
      .query_row(
        "SELECT last_update FROM report_cache WHERE id = ?",
        params![report_id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query report cache: {}", e))?;

    last_update.as_deref().map(parse_timestamp).transpose()
  }

  fn list_reports(&self) -> Result<Vec<ReportSummary>> {
    let conn = self.connect()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, label, row_count, last_update, validation_status
         FROM report_cache
         ORDER BY last_update DESC, id ASC",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<String>>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list cached reports: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cached report: {}", e))?;

    rows
      .into_iter()
      .map(|(id, label, row_count, last_update, validation)| {
        Ok(ReportSummary {
          id,
          label,
          row_count: to_count(row_count),
          last_update: parse_timestamp(&last_update)?,
          validation_status: parse_validation(validation)?,
        })
      })
      .collect()
  }

  fn delete_report(&self, report_id: &str) -> Result<bool> {
    let conn = self.connect()?;

    let deleted = conn
      .execute("DELETE FROM report_cache WHERE id = ?", params![report_id])
      .map_err(|e| eyre!("Failed to delete report cache: {}", e))?;

    Ok(deleted > 0)
  }

  fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.connect()?;

    conn
      .execute(
        "DELETE FROM report_cache WHERE last_update < ?",
        params![format_timestamp(cutoff)],
      )
      .map_err(|e| eyre!("Failed to clear old cache: {}", e))
  }

  fn append_history(&self, record: &UpdateHistoryRecord) -> Result<()> {
    let conn = self.connect()?;

    conn
      .execute(
        INSERT_HISTORY,
        params![
          record.report_id,
          format_timestamp(record.timestamp),
          record.row_count as i64,
          record.success,
          record.error_message,
        ],
      )
      .map_err(|e| eyre!("Failed to record update history: {}", e))?;

    Ok(())
  }

  fn history(&self, report_id: Option<&str>, limit: usize) -> Result<Vec<UpdateHistoryRecord>> {
    let conn = self.connect()?;

    // A NULL filter matches every report
    let mut stmt = conn
      .prepare(
        "SELECT report_id, timestamp, row_count, success, error_message
         FROM update_history
         WHERE ?1 IS NULL OR report_id = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![report_id, to_limit(limit)], history_columns)
      .map_err(|e| eyre!("Failed to query update history: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read update history: {}", e))?;

    rows.into_iter().map(into_history_record).collect()
  }

  fn failures(&self, report_id: Option<&str>, limit: usize) -> Result<Vec<UpdateHistoryRecord>> {
    let conn = self.connect()?;

    let mut stmt = conn
      .prepare(
        "SELECT report_id, timestamp, row_count, success, error_message
         FROM update_history
         WHERE success = 0 AND (?1 IS NULL OR report_id = ?1)
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![report_id, to_limit(limit)], history_columns)
      .map_err(|e| eyre!("Failed to query failed updates: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read failed updates: {}", e))?;

    rows.into_iter().map(into_history_record).collect()
  }

  fn log_query(&self, query: &UserQuery) -> Result<()> {
    let conn = self.connect()?;

    conn
      .execute(
        "INSERT INTO user_queries (query, report_id, timestamp, result_count)
         VALUES (?, ?, ?, ?)",
        params![
          query.query,
          query.report_id,
          format_timestamp(query.timestamp),
          query.result_count,
        ],
      )
      .map_err(|e| eyre!("Failed to log user query: {}", e))?;

    Ok(())
  }

  fn recent_queries(&self, limit: usize) -> Result<Vec<UserQuery>> {
    let conn = self.connect()?;

    let mut stmt = conn
      .prepare(
        "SELECT query, report_id, timestamp, result_count
         FROM user_queries
         ORDER BY timestamp DESC, id DESC
         LIMIT ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![to_limit(limit)], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Option<String>>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<i64>>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query user queries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read user queries: {}", e))?;

    rows
      .into_iter()
      .map(|(query, report_id, timestamp, result_count)| {
        Ok(UserQuery {
          query,
          report_id,
          timestamp: parse_timestamp(&timestamp)?,
          result_count,
        })
      })
      .collect()
  }

  fn log_access(&self, access: &AccessRecord) -> Result<()> {
    let conn = self.connect()?;

    conn
      .execute(
        "INSERT INTO access_log (report_id, source, latency_ms, timestamp)
         VALUES (?, ?, ?, ?)",
        params![
          access.report_id,
          access.source.as_str(),
          i64::try_from(access.latency_ms).unwrap_or(i64::MAX),
          format_timestamp(access.timestamp),
        ],
      )
      .map_err(|e| eyre!("Failed to log access: {}", e))?;

    Ok(())
  }

  fn accesses(&self, report_id: Option<&str>, limit: usize) -> Result<Vec<AccessRecord>> {
    let conn = self.connect()?;

    let mut stmt = conn
      .prepare(
        "SELECT report_id, source, latency_ms, timestamp
         FROM access_log
         WHERE ?1 IS NULL OR report_id = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![report_id, to_limit(limit)], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query access log: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read access log: {}", e))?;

    rows
      .into_iter()
      .map(|(report_id, source, latency_ms, timestamp)| {
        Ok(AccessRecord {
          source: CacheSource::parse(&source)
            .ok_or_else(|| eyre!("Unknown access source '{}'", source))?,
          report_id,
          latency_ms: u64::try_from(latency_ms).unwrap_or(0),
          timestamp: parse_timestamp(&timestamp)?,
        })
      })
      .collect()
  }

  fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<LogSweep> {
    let cutoff = format_timestamp(cutoff);
    let mut conn = self.connect()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let queries = tx
      .execute("DELETE FROM user_queries WHERE timestamp < ?", params![cutoff])
      .map_err(|e| eyre!("Failed to prune user queries: {}", e))?;
    let accesses = tx
      .execute("DELETE FROM access_log WHERE timestamp < ?", params![cutoff])
      .map_err(|e| eyre!("Failed to prune access log: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(LogSweep { queries, accesses })
  }

  fn location(&self) -> Option<&Path> {
    Some(&self.path)
  }
}

type HistoryColumns = (String, String, i64, bool, Option<String>);

fn history_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryColumns> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn into_history_record(
  (report_id, timestamp, row_count, success, error_message): HistoryColumns,
) -> Result<UpdateHistoryRecord> {
  Ok(UpdateHistoryRecord {
    report_id,
    timestamp: parse_timestamp(&timestamp)?,
    row_count: to_count(row_count),
    success,
    error_message,
  })
}

fn parse_validation(raw: Option<String>) -> Result<Option<ValidationStatus>> {
  raw
    .map(|s| serde_json::from_str(&s))
    .transpose()
    .map_err(|e| eyre!("Failed to deserialize validation status: {}", e))
}

fn to_count(value: i64) -> usize {
  usize::try_from(value).unwrap_or(0)
}

fn to_limit(limit: usize) -> i64 {
  i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Format a timestamp for storage.
///
/// Fixed-width UTC with microseconds, so lexical order is chronological order.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`].
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::types::CellValue;
  use chrono::{Duration, TimeZone};
  use tempfile::TempDir;

  fn storage() -> (TempDir, SqliteStorage) {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::open(dir.path().join("nested").join("cache.db")).unwrap();
    (dir, storage)
  }

  fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap()
  }

  fn row(pairs: &[(&str, CellValue)]) -> Row {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.clone()))
      .collect()
  }

  #[test]
  fn test_open_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");

    let first = SqliteStorage::open(&path).unwrap();
    first
      .save_report(&ReportCacheEntry::new("r", "R", vec![], at(1), None))
      .unwrap();

    let second = SqliteStorage::open(&path).unwrap();
    assert!(second.get_report("r").unwrap().is_some());
  }

  #[test]
  fn test_save_and_get_round_trip() {
    let (_dir, storage) = storage();
    let data = vec![
      row(&[("city", "SP".into()), ("count", 10i64.into())]),
      row(&[("city", "RJ".into()), ("count", 2.5f64.into())]),
      row(&[("city", CellValue::Null), ("count", 0i64.into())]),
    ];
    let validation = ValidationStatus {
      ok: false,
      version: Some(2),
      missing_columns: vec!["date".into()],
      ..ValidationStatus::default()
    };
    let entry = ReportCacheEntry::new("r", "Report", data.clone(), at(3), Some(validation.clone()));

    storage.save_report(&entry).unwrap();
    let loaded = storage.get_report("r").unwrap().unwrap();

    assert_eq!(loaded, entry);
    assert_eq!(loaded.data, data);
    assert_eq!(loaded.row_count, 3);
    assert_eq!(loaded.validation_status, Some(validation));
  }

  #[test]
  fn test_get_missing_report() {
    let (_dir, storage) = storage();
    assert!(storage.get_report("missing").unwrap().is_none());
    assert!(storage.get_last_update("missing").unwrap().is_none());
  }

  #[test]
  fn test_upsert_replaces_entry_and_appends_history() {
    let (_dir, storage) = storage();
    storage
      .save_report(&ReportCacheEntry::new("r", "Old", vec![Row::new()], at(1), None))
      .unwrap();
    storage
      .save_report(&ReportCacheEntry::new("r", "New", vec![], at(2), None))
      .unwrap();

    let loaded = storage.get_report("r").unwrap().unwrap();
    assert_eq!(loaded.label, "New");
    assert_eq!(loaded.row_count, 0);
    assert_eq!(loaded.last_update, at(2));
    assert_eq!(storage.list_reports().unwrap().len(), 1);

    let history = storage.history(Some("r"), 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].timestamp, at(2));
    assert_eq!(history[1].row_count, 1);
    assert!(history.iter().all(|h| h.success && h.error_message.is_none()));
  }

  #[test]
  fn test_older_snapshot_overwrites_newer() {
    let (_dir, storage) = storage();
    storage
      .save_report(&ReportCacheEntry::new("r", "R", vec![], at(5), None))
      .unwrap();
    storage
      .save_report(&ReportCacheEntry::new("r", "R", vec![], at(4), None))
      .unwrap();

    assert_eq!(storage.get_last_update("r").unwrap(), Some(at(4)));
  }

  #[test]
  fn test_list_orders_by_last_update_desc() {
    let (_dir, storage) = storage();
    let validation = ValidationStatus {
      ok: false,
      version: Some(3),
      missing_columns: vec!["Data".into()],
      extra_columns: vec!["Obs".into()],
      ..ValidationStatus::default()
    };
    for (id, day) in [("a", 1), ("c", 3), ("b", 2)] {
      let status = (id == "b").then(|| validation.clone());
      storage
        .save_report(&ReportCacheEntry::new(id, id, vec![Row::new()], at(day), status))
        .unwrap();
    }

    let reports = storage.list_reports().unwrap();
    let ids: Vec<&str> = reports.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "b", "a"]);
    assert_eq!(reports[1].validation_status, Some(validation));
    assert_eq!(reports[1].row_count, 1);
    assert_eq!(reports[1].last_update, at(2));
    assert!(reports[0].validation_status.is_none());
  }

  #[test]
  fn test_history_filter_and_limit() {
    let (_dir, storage) = storage();
    storage
      .save_report(&ReportCacheEntry::new("a", "A", vec![], at(1), None))
      .unwrap();
    storage
      .append_history(&UpdateHistoryRecord::failure("b", at(2), "timeout"))
      .unwrap();
    storage
      .save_report(&ReportCacheEntry::new("a", "A", vec![], at(3), None))
      .unwrap();

    let all = storage.history(None, 10).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[1].report_id, "b");
    assert_eq!(all[1].error_message.as_deref(), Some("timeout"));

    assert_eq!(storage.history(Some("a"), 10).unwrap().len(), 2);
    assert_eq!(storage.history(None, 1).unwrap()[0].timestamp, at(3));
    assert!(storage.history(None, 0).unwrap().is_empty());

    let failures = storage.failures(None, 10).unwrap();
    assert_eq!(failures.len(), 1);
    assert!(!failures[0].success);
    assert_eq!(storage.failures(Some("b"), 10).unwrap().len(), 1);
    assert!(storage.failures(Some("a"), 10).unwrap().is_empty());
  }

  #[test]
  fn test_equal_timestamps_order_by_insertion() {
    let (_dir, storage) = storage();
    storage
      .append_history(&UpdateHistoryRecord::failure("r", at(1), "first"))
      .unwrap();
    storage
      .append_history(&UpdateHistoryRecord::failure("r", at(1), "second"))
      .unwrap();

    let history = storage.history(Some("r"), 10).unwrap();
    assert_eq!(history[0].error_message.as_deref(), Some("second"));
  }

  #[test]
  fn test_delete_older_than_keeps_history() {
    let (_dir, storage) = storage();
    storage
      .save_report(&ReportCacheEntry::new("old", "Old", vec![], at(1), None))
      .unwrap();
    storage
      .save_report(&ReportCacheEntry::new("new", "New", vec![], at(10), None))
      .unwrap();

    assert_eq!(storage.delete_older_than(at(5)).unwrap(), 1);
    assert_eq!(storage.delete_older_than(at(5)).unwrap(), 0);
    assert!(storage.get_report("old").unwrap().is_none());
    assert!(storage.get_report("new").unwrap().is_some());
    assert_eq!(storage.history(Some("old"), 10).unwrap().len(), 1);
  }

  #[test]
  fn test_delete_report() {
    let (_dir, storage) = storage();
    storage
      .save_report(&ReportCacheEntry::new("r", "R", vec![], at(1), None))
      .unwrap();

    assert!(storage.delete_report("r").unwrap());
    assert!(!storage.delete_report("r").unwrap());
    assert_eq!(storage.history(Some("r"), 10).unwrap().len(), 1);
  }

  #[test]
  fn test_user_queries() {
    let (_dir, storage) = storage();
    storage
      .log_query(&UserQuery {
        query: "leads sp".into(),
        report_id: Some("leads".into()),
        timestamp: at(1),
        result_count: Some(4),
      })
      .unwrap();
    storage
      .log_query(&UserQuery {
        query: "anything".into(),
        report_id: None,
        timestamp: at(2),
        result_count: None,
      })
      .unwrap();

    let queries = storage.recent_queries(10).unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].query, "anything");
    assert_eq!(queries[1].result_count, Some(4));
  }

  fn access(report_id: &str, source: CacheSource, day: u32) -> AccessRecord {
    AccessRecord {
      report_id: report_id.into(),
      source,
      latency_ms: 120,
      timestamp: at(day),
    }
  }

  #[test]
  fn test_access_log_filter_and_order() {
    let (_dir, storage) = storage();
    storage.log_access(&access("a", CacheSource::Network, 1)).unwrap();
    storage.log_access(&access("b", CacheSource::Offline, 2)).unwrap();
    storage.log_access(&access("a", CacheSource::CacheFresh, 3)).unwrap();

    let all = storage.accesses(None, 10).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0], access("a", CacheSource::CacheFresh, 3));
    assert_eq!(all[1].source, CacheSource::Offline);

    let sources: Vec<CacheSource> = storage
      .accesses(Some("a"), 10)
      .unwrap()
      .into_iter()
      .map(|a| a.source)
      .collect();
    assert_eq!(sources, vec![CacheSource::CacheFresh, CacheSource::Network]);
    assert_eq!(storage.accesses(None, 1).unwrap().len(), 1);
  }

  #[test]
  fn test_log_sweep_spares_update_history() {
    let (_dir, storage) = storage();
    storage
      .save_report(&ReportCacheEntry::new("a", "A", vec![], at(1), None))
      .unwrap();
    storage
      .append_history(&UpdateHistoryRecord::failure("a", at(1), "timeout"))
      .unwrap();
    storage.log_access(&access("a", CacheSource::Network, 1)).unwrap();
    storage.log_access(&access("a", CacheSource::CacheFresh, 10)).unwrap();
    for day in [1, 2, 10] {
      storage
        .log_query(&UserQuery {
          query: format!("day {}", day),
          report_id: None,
          timestamp: at(day),
          result_count: None,
        })
        .unwrap();
    }

    let sweep = storage.delete_logs_older_than(at(5)).unwrap();
    assert_eq!(
      sweep,
      LogSweep {
        queries: 2,
        accesses: 1
      }
    );
    assert_eq!(storage.recent_queries(10).unwrap().len(), 1);
    assert_eq!(storage.accesses(None, 10).unwrap().len(), 1);
    assert_eq!(storage.history(Some("a"), 10).unwrap().len(), 2);
    assert!(storage.get_report("a").unwrap().is_some());

    assert_eq!(storage.delete_logs_older_than(at(5)).unwrap(), LogSweep::default());
  }

  #[test]
  fn test_failed_write_leaves_nothing_behind() {
    let (_dir, storage) = storage();
    let conn = Connection::open(storage.path()).unwrap();
    conn.execute_batch("DROP TABLE update_history").unwrap();

    let entry = ReportCacheEntry::new("r", "R", vec![], at(1), None);
    assert!(storage.save_report(&entry).is_err());
    assert!(storage.get_report("r").unwrap().is_none());
  }

  #[test]
  fn test_timestamp_format_sorts_chronologically() {
    let early = at(1);
    let late = early + Duration::microseconds(1);
    assert!(format_timestamp(early) < format_timestamp(late));
    assert_eq!(parse_timestamp(&format_timestamp(late)).unwrap(), late);
  }
}
