//! Expected column schemas for reports.

use serde::{Deserialize, Serialize};

use crate::cache::{Row, ValidationStatus};

/// Columns a report is expected to carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSchema {
  #[serde(default = "default_version")]
  pub version: u32,
  pub columns: Vec<String>,
}

fn default_version() -> u32 {
  1
}

/// Check `data` against `schema`.
///
/// Headers are taken from the first row. Missing columns fail the check,
/// extra columns are only reported.
pub fn validate(schema: Option<&ReportSchema>, data: &[Row]) -> ValidationStatus {
  let Some(first) = data.first() else {
    return ValidationStatus::failed("empty dataset");
  };

  let Some(schema) = schema else {
    return ValidationStatus {
      warning: Some("no schema defined".to_string()),
      ..ValidationStatus::passed()
    };
  };

  let headers: Vec<String> = first.keys().cloned().collect();
  let missing_columns: Vec<String> = schema
    .columns
    .iter()
    .filter(|col| !first.contains_key(col.as_str()))
    .cloned()
    .collect();
  let extra_columns: Vec<String> = headers
    .iter()
    .filter(|h| !schema.columns.contains(*h))
    .cloned()
    .collect();

  ValidationStatus {
    ok: missing_columns.is_empty(),
    version: Some(schema.version),
    missing_columns,
    extra_columns,
    expected_columns: schema.columns.clone(),
    actual_columns: headers,
    error: None,
    warning: None,
  }
}
