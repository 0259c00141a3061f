//! Engine configuration: one explicit value constructed up front and handed
//! to the reconciler, never ambient globals.

use std::path::PathBuf;

use boxsync_core::{Season, StatCategory};

use crate::detect::CompletenessMode;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the flat-file substrate.
    pub data_root: PathBuf,
    /// DuckDB database file.
    pub database_path: PathBuf,
    /// Where generated CREATE OR REPLACE statements are written.
    pub sql_root: PathBuf,
    /// Where schema-descriptor artifacts are written.
    pub descriptor_root: PathBuf,
    /// Optional verbatim audit file for every schema-mutating statement.
    pub sql_audit_file: Option<PathBuf>,
    /// Schema holding raw ingested tables.
    pub raw_schema: String,
    /// Schema holding derived combined tables.
    pub combined_schema: String,
    pub seasons: Vec<Season>,
    pub categories: Vec<StatCategory>,
    pub completeness: CompletenessMode,
    /// Bounded fan-out for per-game fetches.
    pub fetch_concurrency: usize,
    /// Games buffered before a flush to disk and database.
    pub write_batch: usize,
    /// Retry cap handed to the provider client.
    pub retry_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data/raw"),
            database_path: PathBuf::from("./database/nba.duckdb"),
            sql_root: PathBuf::from("./sql"),
            descriptor_root: PathBuf::from("./descriptors"),
            sql_audit_file: Some(PathBuf::from("./sql_audit.log")),
            raw_schema: "raw".to_string(),
            combined_schema: "base".to_string(),
            seasons: Season::range(1990, 2024),
            categories: StatCategory::ALL.to_vec(),
            completeness: CompletenessMode::RequireBoth,
            fetch_concurrency: 4,
            write_batch: 100,
            retry_cap: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_root: env_path("BOXSYNC_DATA_ROOT", defaults.data_root),
            database_path: env_path("BOXSYNC_DATABASE", defaults.database_path),
            sql_root: env_path("BOXSYNC_SQL_ROOT", defaults.sql_root),
            descriptor_root: env_path("BOXSYNC_DESCRIPTOR_ROOT", defaults.descriptor_root),
            sql_audit_file: std::env::var("BOXSYNC_SQL_AUDIT_FILE")
                .map(|v| if v.is_empty() { None } else { Some(PathBuf::from(v)) })
                .unwrap_or(defaults.sql_audit_file),
            raw_schema: env_string("BOXSYNC_RAW_SCHEMA", defaults.raw_schema),
            combined_schema: env_string("BOXSYNC_COMBINED_SCHEMA", defaults.combined_schema),
            seasons: env_seasons(defaults.seasons),
            categories: env_categories(defaults.categories),
            completeness: match std::env::var("BOXSYNC_COMPLETENESS").as_deref() {
                Ok("per-table") => CompletenessMode::PerTable,
                _ => defaults.completeness,
            },
            fetch_concurrency: env_parse("BOXSYNC_FETCH_CONCURRENCY", defaults.fetch_concurrency),
            write_batch: env_parse("BOXSYNC_WRITE_BATCH", defaults.write_batch),
            retry_cap: env_parse("BOXSYNC_RETRY_CAP", defaults.retry_cap),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `BOXSYNC_SEASONS=2019-2024` selects a start-year range.
fn env_seasons(default: Vec<Season>) -> Vec<Season> {
    let Ok(value) = std::env::var("BOXSYNC_SEASONS") else {
        return default;
    };
    let mut parts = value.splitn(2, '-').filter_map(|p| p.trim().parse::<i32>().ok());
    match (parts.next(), parts.next()) {
        (Some(start), Some(end)) if start <= end => Season::range(start, end),
        _ => default,
    }
}

/// `BOXSYNC_CATEGORIES=advanced,misc` restricts the category list.
fn env_categories(default: Vec<StatCategory>) -> Vec<StatCategory> {
    let Ok(value) = std::env::var("BOXSYNC_CATEGORIES") else {
        return default;
    };
    let parsed: Vec<StatCategory> = value
        .split(',')
        .filter_map(|part| StatCategory::parse(part.trim()).ok())
        .collect();
    if parsed.is_empty() {
        default
    } else {
        parsed
    }
}
