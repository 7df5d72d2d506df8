//! Remote report sources.

use std::future::Future;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::cache::Row;
use crate::config::{FetchConfig, ReportConfig};

/// Something that can fetch the rows of a configured report.
pub trait ReportSource: Send + Sync {
  fn fetch_rows(&self, report: &ReportConfig) -> impl Future<Output = Result<Vec<Row>>> + Send;
}

/// Fetches rows over HTTP from an endpoint that returns a JSON array of objects.
#[derive(Clone)]
pub struct HttpJsonSource {
  client: reqwest::Client,
}

impl HttpJsonSource {
  pub fn new(config: &FetchConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl ReportSource for HttpJsonSource {
  fn fetch_rows(&self, report: &ReportConfig) -> impl Future<Output = Result<Vec<Row>>> + Send {
    let client = self.client.clone();
    let url = report.url.clone();

    async move {
      let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?
        .error_for_status()
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

      let rows = parse_rows(&body).map_err(|e| eyre!("Invalid rows from {}: {}", url, e))?;
      debug!(%url, rows = rows.len(), "rows fetched");
      Ok(rows)
    }
  }
}

/// Decode a JSON array of row objects.
pub fn parse_rows(body: &[u8]) -> Result<Vec<Row>> {
  serde_json::from_slice(body).map_err(|e| eyre!("{}", e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CellValue;

  #[test]
  fn test_parse_rows_keeps_order() {
    let body = br#"[{"Cidade":"SP","Total":10},{"Cidade":"RJ","Total":null}]"#;
    let rows = parse_rows(body).unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["Cidade"].as_str(), Some("SP"));
    assert_eq!(rows[0]["Total"], CellValue::from(10i64));
    assert!(rows[1]["Total"].is_null());
  }

  #[test]
  fn test_parse_rows_rejects_nested_values() {
    assert!(parse_rows(br#"[{"a":{"b":1}}]"#).is_err());
    assert!(parse_rows(br#"{"a":1}"#).is_err());
  }
}
