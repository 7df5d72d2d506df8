//! Durable report cache: the latest snapshot of each remote report, with
//! freshness checks, stale fallback when the source is down, and an
//! append-only history of fetch attempts.

pub mod cache;
pub mod config;
pub mod loader;
pub mod logging;
pub mod schema;
pub mod source;
