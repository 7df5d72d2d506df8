//! Core types for the report cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single scalar cell of a row-record.
///
/// Numbers keep their exact JSON representation so integers and floats
/// survive a save/load cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
  Null,
  Bool(bool),
  Number(serde_json::Number),
  Text(String),
}

impl CellValue {
  /// Text content, if this cell holds text.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Self::Null)
  }
}

impl From<&str> for CellValue {
  fn from(value: &str) -> Self {
    Self::Text(value.to_string())
  }
}

impl From<String> for CellValue {
  fn from(value: String) -> Self {
    Self::Text(value)
  }
}

impl From<i64> for CellValue {
  fn from(value: i64) -> Self {
    Self::Number(value.into())
  }
}

impl From<f64> for CellValue {
  /// Non-finite floats have no JSON representation and become `Null`.
  fn from(value: f64) -> Self {
    serde_json::Number::from_f64(value)
      .map(Self::Number)
      .unwrap_or(Self::Null)
  }
}

impl From<bool> for CellValue {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(Self::Null)
  }
}

/// One row of tabular data: column name to scalar value.
///
/// Column order is not significant; the order of rows in a dataset is.
pub type Row = BTreeMap<String, CellValue>;

/// Outcome of checking a dataset against the expected column schema of its report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStatus {
  pub ok: bool,
  /// Schema version the data was checked against
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<u32>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub missing_columns: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub extra_columns: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub expected_columns: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub actual_columns: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub warning: Option<String>,
}

impl ValidationStatus {
  /// A bare passing status with no column details.
  pub fn passed() -> Self {
    Self {
      ok: true,
      ..Self::default()
    }
  }

  /// A failing status carrying an error message.
  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      ok: false,
      error: Some(error.into()),
      ..Self::default()
    }
  }
}

/// The most recent snapshot of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCacheEntry {
  pub report_id: String,
  pub label: String,
  pub data: Vec<Row>,
  /// Always equal to `data.len()`
  pub row_count: usize,
  pub last_update: DateTime<Utc>,
  pub validation_status: Option<ValidationStatus>,
}

impl ReportCacheEntry {
  pub fn new(
    report_id: impl Into<String>,
    label: impl Into<String>,
    data: Vec<Row>,
    last_update: DateTime<Utc>,
    validation_status: Option<ValidationStatus>,
  ) -> Self {
    Self {
      report_id: report_id.into(),
      label: label.into(),
      row_count: data.len(),
      data,
      last_update,
      validation_status,
    }
  }
}

/// A cached report without its data, as shown by inspection tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
  pub id: String,
  pub label: String,
  pub row_count: usize,
  pub last_update: DateTime<Utc>,
  pub validation_status: Option<ValidationStatus>,
}

/// One fetch attempt in the append-only update history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHistoryRecord {
  pub report_id: String,
  pub timestamp: DateTime<Utc>,
  pub row_count: usize,
  pub success: bool,
  /// Present iff `success` is false
  pub error_message: Option<String>,
}

impl UpdateHistoryRecord {
  pub fn failure(
    report_id: impl Into<String>,
    timestamp: DateTime<Utc>,
    error_message: impl Into<String>,
  ) -> Self {
    Self {
      report_id: report_id.into(),
      timestamp,
      row_count: 0,
      success: false,
      error_message: Some(error_message.into()),
    }
  }
}

/// A logged user query (analytics only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuery {
  pub query: String,
  pub report_id: Option<String>,
  pub timestamp: DateTime<Utc>,
  pub result_count: Option<i64>,
}

/// Aggregate view over failed fetch attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStats {
  pub total: usize,
  pub by_report: BTreeMap<String, usize>,
  pub by_reason: BTreeMap<String, usize>,
  /// Failures newer than the requested window
  pub in_window: usize,
  pub last_failure: Option<DateTime<Utc>>,
}

/// A report served to a caller, with where it came from and how long it took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
  pub report_id: String,
  pub source: CacheSource,
  pub latency_ms: u64,
  pub timestamp: DateTime<Utc>,
}

/// Aggregate view over served reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessStats {
  pub total: usize,
  pub by_source: BTreeMap<String, usize>,
  pub by_report: BTreeMap<String, usize>,
  pub avg_latency_ms: f64,
  /// Accesses newer than the requested window
  pub in_window: usize,
}

/// Rows removed from the telemetry logs by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSweep {
  pub queries: usize,
  pub accesses: usize,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Nothing cached and the fetch failed
  Unavailable,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::CacheFresh => "cache_fresh",
      Self::Offline => "offline",
      Self::Unavailable => "unavailable",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "network" => Some(Self::Network),
      "cache_fresh" => Some(Self::CacheFresh),
      "offline" => Some(Self::Offline),
      "unavailable" => Some(Self::Unavailable),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cell_values_keep_json_shape() {
    let json = r#"{"a":"SP","b":10,"c":1.5,"d":null,"e":true}"#;
    let row: Row = serde_json::from_str(json).unwrap();

    assert_eq!(row["a"], CellValue::from("SP"));
    assert_eq!(row["b"], CellValue::from(10i64));
    assert_eq!(row["c"], CellValue::from(1.5f64));
    assert!(row["d"].is_null());
    assert_eq!(row["e"], CellValue::Bool(true));
    assert_eq!(serde_json::to_string(&row).unwrap(), json);
  }

  #[test]
  fn test_non_finite_float_becomes_null() {
    assert!(CellValue::from(f64::NAN).is_null());
  }

  #[test]
  fn test_minimal_validation_status() {
    let status: ValidationStatus = serde_json::from_str(r#"{"ok": true}"#).unwrap();
    assert_eq!(status, ValidationStatus::passed());
    assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"ok":true}"#);
  }

  #[test]
  fn test_cache_source_names_match_serde() {
    for source in [
      CacheSource::Network,
      CacheSource::CacheFresh,
      CacheSource::Offline,
      CacheSource::Unavailable,
    ] {
      let json = serde_json::to_string(&source).unwrap();
      assert_eq!(json, format!("\"{}\"", source.as_str()));
      assert_eq!(CacheSource::parse(source.as_str()), Some(source));
    }
    assert_eq!(CacheSource::parse("sheets"), None);
  }

  #[test]
  fn test_entry_row_count_tracks_data() {
    let rows = vec![Row::new(), Row::new(), Row::new()];
    let entry = ReportCacheEntry::new("r", "R", rows, Utc::now(), None);
    assert_eq!(entry.row_count, 3);
    assert_eq!(entry.row_count, entry.data.len());
  }
}
