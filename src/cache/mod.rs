//! Durable report cache with freshness tracking and an update-history ledger.
//!
//! This module provides:
//! - A storage trait with a SQLite backend and a no-op backend for when caching is disabled
//! - A fail-soft facade that turns storage faults into benign return values
//! - An async cache-first fetch layer that falls back to stale data when the source is down
//!   and records every report it serves in the access log

mod layer;
mod service;
mod storage;
mod types;

pub use layer::{CacheLayer, ReportData};
pub use service::{
  default_max_age, Clock, DynReportCache, ManualClock, ReportCache, SystemClock,
  DEFAULT_HISTORY_LIMIT, DEFAULT_RETENTION_DAYS,
};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use types::{
  AccessRecord, AccessStats, CacheResult, CacheSource, CellValue, FailureStats, LogSweep,
  ReportCacheEntry, ReportSummary, Row, UpdateHistoryRecord, UserQuery, ValidationStatus,
};
