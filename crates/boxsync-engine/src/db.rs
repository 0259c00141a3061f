//! DuckDB access: scoped connections, information_schema introspection, and
//! the SQL audit channel every schema-mutating statement passes through.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use boxsync_core::GameId;
use duckdb::Connection;
use tracing::{info, warn};

use crate::sqlgen::quote_ident;

/// Verbatim audit channel for schema-mutating SQL. Constructed once and
/// passed by reference; emits on the `sql_audit` tracing target and appends
/// to a file when one is configured.
#[derive(Debug, Clone, Default)]
pub struct SqlAudit {
    file: Option<PathBuf>,
}

impl SqlAudit {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self { file }
    }

    pub fn record(&self, statement: &str) {
        info!(target: "sql_audit", statement);
        if let Some(path) = &self.file {
            if let Err(err) = append_line(path, statement) {
                // Audit-file trouble must not fail the statement itself.
                warn!(path = %path.display(), error = %err, "could not append to sql audit file");
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// A live database handle scoped to one component call.
pub struct Db {
    conn: Connection,
    audit: SqlAudit,
}

impl Db {
    /// Opening the database is the one unrecoverable failure of a run.
    pub fn open(path: &Path, audit: SqlAudit) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Ok(Self { conn, audit })
    }

    pub fn open_in_memory(audit: SqlAudit) -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Ok(Self { conn, audit })
    }

    /// Execute a schema-mutating statement, recording it verbatim first.
    pub fn execute_logged(&self, sql: &str) -> Result<()> {
        self.audit.record(sql);
        self.conn
            .execute_batch(sql)
            .with_context(|| format!("executing: {sql}"))
    }

    pub fn query_count(&self, sql: &str) -> Result<i64> {
        self.conn
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("counting via: {sql}"))
    }

    pub fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql).with_context(|| format!("preparing: {sql}"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .with_context(|| format!("querying: {sql}"))?;
        let mut out = Vec::new();
        for value in rows {
            out.push(value.with_context(|| format!("reading row of: {sql}"))?);
        }
        Ok(out)
    }

    pub fn schema_exists(&self, schema: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = ?",
                [schema],
                |row| row.get(0),
            )
            .context("querying information_schema.schemata")?;
        Ok(count > 0)
    }

    /// Create the schema if absent, exactly once.
    pub fn ensure_schema(&self, schema: &str) -> Result<()> {
        if self.schema_exists(schema)? {
            return Ok(());
        }
        info!(schema, "creating schema");
        self.execute_logged(&format!("CREATE SCHEMA {};", quote_ident(schema)))
    }

    pub fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                [schema, table],
                |row| row.get(0),
            )
            .context("querying information_schema.tables")?;
        Ok(count > 0)
    }

    /// Ordered (column name, storage type) pairs for one table.
    pub fn table_columns(&self, schema: &str, table: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
            )
            .context("preparing information_schema.columns query")?;
        let rows = stmt
            .query_map([schema, table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("querying information_schema.columns")?;
        let mut out = Vec::new();
        for pair in rows {
            out.push(pair.context("reading information_schema.columns row")?);
        }
        Ok(out)
    }

    /// (table, column) pairs for every table whose name matches the LIKE
    /// pattern or appears in `extra_tables`, in registration order
    /// (table name, then ordinal position).
    pub fn columns_for_tables(
        &self,
        schema: &str,
        like_pattern: &str,
        extra_tables: &[&str],
    ) -> Result<Vec<(String, String)>> {
        let extras = extra_tables
            .iter()
            .map(|t| format!("'{}'", t.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        let in_clause = if extras.is_empty() {
            String::from("FALSE")
        } else {
            format!("table_name IN ({extras})")
        };
        let sql = format!(
            "SELECT table_name, column_name FROM information_schema.columns \
             WHERE table_schema = ? AND (table_name LIKE ? OR {in_clause}) \
             ORDER BY table_name, ordinal_position"
        );
        let mut stmt = self.conn.prepare(&sql).context("preparing column-source query")?;
        let rows = stmt
            .query_map([schema, like_pattern], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("querying column sources")?;
        let mut out = Vec::new();
        for pair in rows {
            out.push(pair.context("reading column-source row")?);
        }
        Ok(out)
    }

    /// Distinct normalized game ids of one table, read back as text so
    /// integer-typed and text-typed identifier columns compare alike.
    pub fn distinct_game_ids(&self, schema: &str, table: &str, column: &str) -> Result<BTreeSet<GameId>> {
        let sql = format!(
            "SELECT DISTINCT CAST({col} AS VARCHAR) FROM {schema}.{table} WHERE {col} IS NOT NULL",
            col = quote_ident(column),
            schema = quote_ident(schema),
            table = quote_ident(table),
        );
        Ok(self.query_strings(&sql)?.into_iter().map(GameId::normalize).collect())
    }
}
