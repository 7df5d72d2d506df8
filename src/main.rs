use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;

use report_cache::cache::{
  AccessRecord, AccessStats, CacheLayer, CacheSource, FailureStats, UpdateHistoryRecord,
  DEFAULT_HISTORY_LIMIT,
};
use report_cache::config::Config;
use report_cache::loader::ReportLoader;
use report_cache::logging;
use report_cache::source::HttpJsonSource;

#[derive(Parser, Debug)]
#[command(name = "rcache")]
#[command(about = "Inspect and maintain the report cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cached reports, most recently updated first
  List,
  /// Print a cached report
  Show { report_id: String },
  /// Exit 0 if the report is fresh, 1 otherwise
  Fresh {
    report_id: String,
    /// Maximum age in hours (default: cache.max_age_hours)
    #[arg(long)]
    max_age_hours: Option<i64>,
  },
  /// Show the update history
  History {
    #[arg(short, long)]
    report: Option<String>,
    /// Number of records (default: cache.history_limit)
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// Summarize failed fetch attempts
  Failures {
    /// Only list failures of this report
    #[arg(short, long)]
    report: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
    #[arg(long, default_value_t = 24)]
    window_hours: i64,
  },
  /// Show served reports and where they came from
  Accesses {
    #[arg(short, long)]
    report: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
    #[arg(long, default_value_t = 24)]
    window_hours: i64,
  },
  /// Remove reports older than N days (default: cache.retention_days)
  Clear {
    #[arg(short, long)]
    days: Option<i64>,
  },
  /// Remove logged queries and accesses older than N days (default: cache.retention_days)
  PruneLogs {
    #[arg(short, long)]
    days: Option<i64>,
  },
  /// Delete one cached report
  Delete { report_id: String },
  /// Fetch configured reports, using the cache when fresh
  Refresh {
    /// Ignore fresh cache entries
    #[arg(short, long)]
    force: bool,
  },
  /// Show logged user queries
  Queries {
    #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let log_guard = logging::init(&config.log_dir()?)?;

  // Schema creation failure is fatal
  let cache = config.open_cache()?;
  let layer = CacheLayer::new(cache).with_stale_time(config.cache.max_age());

  match args.command {
    Command::List => {
      let reports = layer.blocking(|cache| cache.list_cached_reports()).await?;
      print_json(&reports)?;
    }
    Command::Show { report_id } => {
      let entry = layer
        .blocking(move |cache| {
          let entry = cache.get_report_cache(&report_id);
          let count = entry.as_ref().map(|e| e.row_count as i64);
          cache.log_user_query(&format!("show {}", report_id), Some(report_id.as_str()), count);
          entry.ok_or_else(|| eyre!("Report '{}' is not cached", report_id))
        })
        .await??;
      print_json(&entry)?;
    }
    Command::Fresh {
      report_id,
      max_age_hours,
    } => {
      let max_age = match max_age_hours {
        Some(hours) => chrono::Duration::try_hours(hours)
          .ok_or_else(|| eyre!("max age of {} hours is out of range", hours))?,
        None => layer.stale_time(),
      };
      let fresh = layer
        .blocking(move |cache| cache.is_cache_fresh(&report_id, max_age))
        .await?;
      print_json(&fresh)?;
      if !fresh {
        drop(log_guard);
        std::process::exit(1);
      }
    }
    Command::History { report, limit } => {
      let limit = limit.unwrap_or(config.cache.history_limit);
      let history = layer
        .blocking(move |cache| cache.get_update_history(report.as_deref(), limit))
        .await?;
      print_json(&history)?;
    }
    Command::Failures {
      report,
      limit,
      window_hours,
    } => {
      let window = window_of(window_hours)?;
      let (stats, recent) = layer
        .blocking(move |cache| {
          (
            cache.failure_stats(window),
            cache.get_failures(report.as_deref(), limit),
          )
        })
        .await?;
      print_json(&FailureReport { stats, recent })?;
    }
    Command::Accesses {
      report,
      limit,
      window_hours,
    } => {
      let window = window_of(window_hours)?;
      let (stats, recent) = layer
        .blocking(move |cache| {
          (
            cache.access_stats(window),
            cache.get_accesses(report.as_deref(), limit),
          )
        })
        .await?;
      print_json(&AccessReport { stats, recent })?;
    }
    Command::PruneLogs { days } => {
      let days = days.unwrap_or(config.cache.retention_days);
      let removed = layer.blocking(move |cache| cache.clear_old_logs(days)).await?;
      print_json(&removed)?;
    }
    Command::Clear { days } => {
      let days = days.unwrap_or(config.cache.retention_days);
      let removed = layer.blocking(move |cache| cache.clear_old_cache(days)).await?;
      print_json(&ClearOutcome { days, removed })?;
    }
    Command::Delete { report_id } => {
      let deleted = layer
        .blocking(move |cache| cache.delete_report_cache(&report_id))
        .await?;
      print_json(&deleted)?;
    }
    Command::Refresh { force } => {
      let source = HttpJsonSource::new(&config.fetch)?;
      let loader = ReportLoader::new(layer, source, config.reports.clone());
      let loaded = loader.load_all(force).await?;

      let summary: Vec<RefreshOutcome> = loaded
        .reports
        .iter()
        .map(|(id, report)| RefreshOutcome {
          id,
          label: &report.label,
          rows: report.row_count(),
          source: report.source,
          valid: report.validation_status.as_ref().map(|v| v.ok),
          error: report.error.as_deref(),
        })
        .collect();
      print_json(&summary)?;
    }
    Command::Queries { limit } => {
      let queries = layer
        .blocking(move |cache| cache.get_recent_queries(limit))
        .await?;
      print_json(&queries)?;
    }
  }

  Ok(())
}

#[derive(Serialize)]
struct ClearOutcome {
  days: i64,
  removed: usize,
}

#[derive(Serialize)]
struct FailureReport {
  stats: FailureStats,
  recent: Vec<UpdateHistoryRecord>,
}

#[derive(Serialize)]
struct AccessReport {
  stats: AccessStats,
  recent: Vec<AccessRecord>,
}

#[derive(Serialize)]
struct RefreshOutcome<'a> {
  id: &'a str,
  label: &'a str,
  rows: usize,
  source: CacheSource,
  valid: Option<bool>,
  error: Option<&'a str>,
}

fn window_of(hours: i64) -> Result<chrono::Duration> {
  chrono::Duration::try_hours(hours)
    .ok_or_else(|| eyre!("window of {} hours is out of range", hours))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}
