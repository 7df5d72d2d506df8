//! Loads every configured report through the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheLayer, CacheSource, CacheStorage, ReportData, Row, ValidationStatus};
use crate::config::ReportConfig;
use crate::schema;
use crate::source::ReportSource;

/// The outcome of loading one report.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedReport {
  pub label: String,
  pub data: Vec<Row>,
  pub validation_status: Option<ValidationStatus>,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
  /// Why the source could not be used, when it could not
  pub error: Option<String>,
}

impl LoadedReport {
  pub fn row_count(&self) -> usize {
    self.data.len()
  }
}

/// Every configured report, keyed by id.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedReports {
  pub reports: BTreeMap<String, LoadedReport>,
  pub loaded_at: DateTime<Utc>,
}

/// Refreshes the configured reports, cache first.
pub struct ReportLoader<S: CacheStorage + ?Sized, R: ReportSource> {
  layer: CacheLayer<S>,
  source: Arc<R>,
  reports: Vec<ReportConfig>,
}

impl<S: CacheStorage + ?Sized + 'static, R: ReportSource> ReportLoader<S, R> {
  pub fn new(layer: CacheLayer<S>, source: R, reports: Vec<ReportConfig>) -> Self {
    Self {
      layer,
      source: Arc::new(source),
      reports,
    }
  }

  /// Load every configured report.
  ///
  /// Unless `force` is set and as long as every report is fresh, the cache
  /// answers alone. Otherwise all reports are fetched concurrently, each
  /// falling back to its cached copy on failure.
  pub async fn load_all(&self, force: bool) -> Result<LoadedReports> {
    let ids: Vec<String> = self.reports.iter().map(|r| r.id.clone()).collect();

    if !force && !ids.is_empty() && self.layer.all_fresh(ids).await? {
      info!("all reports fresh, serving from cache");
      return self.load_from_cache().await;
    }

    let loads = self.reports.iter().map(|report| self.load_one(report, force));
    let reports = join_all(loads).await.into_iter().collect();

    Ok(LoadedReports {
      reports,
      loaded_at: self.layer.cache().now(),
    })
  }

  async fn load_from_cache(&self) -> Result<LoadedReports> {
    let mut reports = BTreeMap::new();

    for report in &self.reports {
      let loaded = match self.layer.cached(&report.id).await? {
        Some(entry) => LoadedReport {
          label: entry.label,
          data: entry.data,
          validation_status: entry.validation_status,
          source: CacheSource::CacheFresh,
          cached_at: Some(entry.last_update),
          error: None,
        },
        // Swept or deleted between the freshness check and now
        None => unavailable(report, "cache entry disappeared".to_string()),
      };
      reports.insert(report.id.clone(), loaded);
    }

    Ok(LoadedReports {
      reports,
      loaded_at: self.layer.cache().now(),
    })
  }

  async fn load_one(&self, report: &ReportConfig, force: bool) -> (String, LoadedReport) {
    let source = Arc::clone(&self.source);
    let fetcher = || async move {
      let data = source.fetch_rows(report).await?;
      let validation = schema::validate(report.schema.as_ref(), &data);
      if !validation.ok {
        warn!(
          report_id = %report.id,
          missing = ?validation.missing_columns,
          extra = ?validation.extra_columns,
          "report does not match its schema"
        );
      }
      Ok(ReportData {
        data,
        validation_status: Some(validation),
      })
    };

    let result = if force {
      self.layer.refresh_report(&report.id, &report.label, fetcher).await
    } else {
      self.layer.fetch_report(&report.id, &report.label, fetcher).await
    };

    let loaded = match result {
      Ok(result) => {
        info!(
          report_id = %report.id,
          rows = result.data.data.len(),
          source = ?result.source,
          "report loaded"
        );
        LoadedReport {
          label: report.label.clone(),
          data: result.data.data,
          validation_status: result.data.validation_status,
          source: result.source,
          cached_at: result.cached_at,
          error: None,
        }
      }
      Err(e) => {
        warn!(report_id = %report.id, error = %e, "report unavailable");
        unavailable(report, e.to_string())
      }
    };

    (report.id.clone(), loaded)
  }
}

fn unavailable(report: &ReportConfig, error: String) -> LoadedReport {
  LoadedReport {
    label: report.label.clone(),
    data: Vec::new(),
    validation_status: Some(ValidationStatus::failed(error.clone())),
    source: CacheSource::Unavailable,
    cached_at: None,
    error: Some(error),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CellValue, Clock, ManualClock, ReportCache, SqliteStorage};
  use crate::schema::ReportSchema;
  use chrono::{Duration, TimeZone};
  use color_eyre::eyre::eyre;
  use std::collections::HashMap;
  use std::future::Future;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use tempfile::TempDir;

  /// In-memory source whose answers can be changed between loads.
  #[derive(Default)]
  struct FakeSource {
    answers: Mutex<HashMap<String, std::result::Result<Vec<Row>, String>>>,
    calls: AtomicUsize,
  }

  impl FakeSource {
    fn answer(&self, id: &str, answer: std::result::Result<Vec<Row>, String>) {
      self.answers.lock().unwrap().insert(id.to_string(), answer);
    }
  }

  impl ReportSource for Arc<FakeSource> {
    fn fetch_rows(&self, report: &ReportConfig) -> impl Future<Output = Result<Vec<Row>>> + Send {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let answer = self
        .answers
        .lock()
        .unwrap()
        .get(&report.id)
        .cloned()
        .unwrap_or_else(|| Err("no answer".to_string()));
      async move { answer.map_err(|e| eyre!(e)) }
    }
  }

  fn leads_row() -> Row {
    [("Cidade", "SP"), ("Novos Clientes", "10"), ("Data", "2025-01-01")]
      .into_iter()
      .map(|(k, v)| (k.to_string(), CellValue::from(v)))
      .collect()
  }

  fn reports() -> Vec<ReportConfig> {
    vec![
      ReportConfig {
        id: "leads".into(),
        label: "Novos Clientes".into(),
        url: "https://example.com/leads.json".parse().unwrap(),
        schema: Some(ReportSchema {
          version: 1,
          columns: vec!["Cidade".into(), "Novos Clientes".into(), "Data".into()],
        }),
      },
      ReportConfig {
        id: "queijo".into(),
        label: "Queijo do Reino".into(),
        url: "https://example.com/queijo.json".parse().unwrap(),
        schema: Some(ReportSchema {
          version: 1,
          columns: vec!["Código Cliente".into(), "Nome".into()],
        }),
      },
    ]
  }

  fn loader() -> (
    TempDir,
    Arc<ManualClock>,
    Arc<FakeSource>,
    ReportLoader<SqliteStorage, Arc<FakeSource>>,
  ) {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()));
    let cache = ReportCache::open(dir.path().join("cache.db"))
      .unwrap()
      .with_clock(Arc::clone(&clock));
    let source = Arc::new(FakeSource::default());
    let loader = ReportLoader::new(CacheLayer::new(cache), Arc::clone(&source), reports());
    (dir, clock, source, loader)
  }

  #[tokio::test]
  async fn test_first_load_fetches_and_validates() {
    let (_dir, _clock, source, loader) = loader();
    source.answer("leads", Ok(vec![leads_row()]));
    source.answer("queijo", Ok(vec![leads_row()]));

    let loaded = loader.load_all(false).await.unwrap();

    assert_eq!(loaded.loaded_at, Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
    let leads = &loaded.reports["leads"];
    assert_eq!(leads.source, CacheSource::Network);
    assert_eq!(leads.row_count(), 1);
    assert!(leads.validation_status.as_ref().unwrap().ok);

    // Loaded even though the columns do not match
    let queijo = &loaded.reports["queijo"];
    assert_eq!(queijo.row_count(), 1);
    let validation = queijo.validation_status.as_ref().unwrap();
    assert!(!validation.ok);
    assert_eq!(validation.missing_columns.len(), 2);
  }

  #[tokio::test]
  async fn test_all_fresh_serves_cache_without_fetching() {
    let (_dir, clock, source, loader) = loader();
    source.answer("leads", Ok(vec![leads_row()]));
    source.answer("queijo", Ok(vec![]));
    loader.load_all(false).await.unwrap();
    clock.advance(Duration::hours(2));

    let loaded = loader.load_all(false).await.unwrap();

    assert_eq!(loaded.loaded_at, clock.now());
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert!(loaded
      .reports
      .values()
      .all(|r| r.source == CacheSource::CacheFresh));
  }

  #[tokio::test]
  async fn test_force_refetches_everything() {
    let (_dir, _clock, source, loader) = loader();
    source.answer("leads", Ok(vec![leads_row()]));
    source.answer("queijo", Ok(vec![]));
    loader.load_all(false).await.unwrap();

    let loaded = loader.load_all(true).await.unwrap();

    assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    assert!(loaded
      .reports
      .values()
      .all(|r| r.source == CacheSource::Network));
  }

  #[tokio::test]
  async fn test_failures_fall_back_to_cache_or_empty() {
    let (_dir, clock, source, loader) = loader();
    source.answer("leads", Ok(vec![leads_row()]));
    loader.load_all(false).await.unwrap();
    clock.advance(Duration::days(2));

    source.answer("leads", Err("HTTP 500".into()));
    let loaded = loader.load_all(false).await.unwrap();

    let leads = &loaded.reports["leads"];
    assert_eq!(leads.source, CacheSource::Offline);
    assert_eq!(leads.data, vec![leads_row()]);

    let queijo = &loaded.reports["queijo"];
    assert_eq!(queijo.source, CacheSource::Unavailable);
    assert!(queijo.data.is_empty());
    assert!(queijo.error.as_deref().unwrap().contains("no answer"));
    assert!(!queijo.validation_status.as_ref().unwrap().ok);
  }
}
