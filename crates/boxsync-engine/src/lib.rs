//! Reconciliation & schema-unification engine: missing-data detection across
//! the flat-file and database substrates, schema-inferring table builds, and
//! column-coalescing SQL generation for the unified tables.

pub mod config;
pub mod db;
pub mod detect;
pub mod reconcile;
pub mod schema;
pub mod sqlgen;
pub mod tables;

pub use config::EngineConfig;
pub use db::{Db, SqlAudit};
pub use detect::{missing_ids, CompletenessMode, MissingDataDetector};
pub use reconcile::{Reconciler, RunSummary, UnitReport, UnitState};
pub use schema::{infer_schema, ColumnType, TableSchema};
pub use sqlgen::{generate_unified_query, players_profile, teams_profile, ColumnSources, EntityProfile};
pub use tables::{BuildMode, TableBuilder, TableReport};
