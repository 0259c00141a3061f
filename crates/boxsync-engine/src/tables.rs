//! Schema-inferring table builder: derives column definitions from sampled
//! files, (re)creates backing tables idempotently, and appends only rows not
//! already present by primary key.

use std::path::PathBuf;

use anyhow::{Context, Result};
use boxsync_core::TableFamily;
use serde::Serialize;
use tracing::info;

use crate::db::Db;
use crate::schema::{infer_unioned_schema, TableSchema};
use crate::sqlgen::{quote_ident, quote_literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Insert only rows absent from the existing table (by primary key).
    AppendNewOnly,
    /// Drop/replace and reload the full union of all files. Only for derived
    /// tables like the game log, never for large incremental stat tables.
    FullRebuild,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub created: bool,
    pub missing_rows: i64,
    pub inserted_rows: i64,
    pub descriptor_written: bool,
}

pub struct TableBuilder<'a> {
    db: &'a Db,
    schema: String,
    descriptor_root: PathBuf,
}

impl<'a> TableBuilder<'a> {
    pub fn new(db: &'a Db, schema: impl Into<String>, descriptor_root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            schema: schema.into(),
            descriptor_root: descriptor_root.into(),
        }
    }

    /// Create or update one backing table from a set of delimited files.
    pub fn build_or_update(
        &self,
        family: TableFamily,
        files: &[PathBuf],
        mode: BuildMode,
    ) -> Result<TableReport> {
        let table = family.table_name();
        anyhow::ensure!(!files.is_empty(), "no csv files found for table {table}");

        self.db.ensure_schema(&self.schema)?;

        let keys = family.key_columns();
        let inferred = infer_unioned_schema(files)
            .with_context(|| format!("inferring schema for {table}"))?;
        for key in keys {
            anyhow::ensure!(
                inferred.contains(key),
                "key column {key} absent from source files for {table}"
            );
        }

        let existed = self.db.table_exists(&self.schema, &table)?;
        let replace = mode == BuildMode::FullRebuild || !existed;
        if replace {
            self.db
                .execute_logged(&create_table_sql(&self.schema, &table, &inferred, keys))?;
        }

        // The live table dictates insert column order and cast targets, so an
        // append into an older, narrower table stays positionally correct.
        let table_columns = self.db.table_columns(&self.schema, &table)?;
        let csv_expr = read_csv_expr(files);
        let anti_join = mode == BuildMode::AppendNewOnly;

        let missing = self.db.query_count(&count_missing_sql(
            &self.schema,
            &table,
            &table_columns,
            keys,
            &csv_expr,
            anti_join && existed,
            anti_join,
        ))?;

        let inserted = if missing > 0 || replace {
            let insert = insert_sql(
                &self.schema,
                &table,
                &table_columns,
                &inferred,
                keys,
                &csv_expr,
                anti_join && existed,
                anti_join,
            );
            self.db.execute_logged(&insert)?;
            missing
        } else {
            0
        };

        let descriptor_written = self.write_descriptor(&table, keys, false)?;

        Ok(TableReport {
            table,
            created: replace,
            missing_rows: missing,
            inserted_rows: inserted,
            descriptor_written,
        })
    }

    /// Emit the machine-readable schema descriptor for one table.
    ///
    /// Append-or-skip: an existing descriptor stays untouched unless
    /// `redefine` is set. Returns whether a file was written.
    pub fn write_descriptor(&self, table: &str, keys: &[&str], redefine: bool) -> Result<bool> {
        let path = self
            .descriptor_root
            .join(format!("{}_{}.yaml", self.schema, table));
        if path.exists() && !redefine {
            info!(path = %path.display(), "descriptor already exists; leaving as-is");
            return Ok(false);
        }

        let columns = self.db.table_columns(&self.schema, table)?;
        anyhow::ensure!(!columns.is_empty(), "no columns found for {}.{table}", self.schema);

        let descriptor = DescriptorFile {
            name: format!("{}.{}", self.schema, table),
            gateway: "duckdb",
            columns: columns
                .into_iter()
                .map(|(name, data_type)| DescriptorColumn { name, data_type })
                .collect(),
            primary_key: keys.iter().map(|k| k.to_string()).collect(),
        };

        std::fs::create_dir_all(&self.descriptor_root).with_context(|| {
            format!("creating descriptor directory {}", self.descriptor_root.display())
        })?;
        let yaml = serde_yaml::to_string(&descriptor).context("serializing descriptor")?;
        std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "wrote schema descriptor");
        Ok(true)
    }
}

#[derive(Debug, Serialize)]
struct DescriptorFile {
    name: String,
    gateway: &'static str,
    columns: Vec<DescriptorColumn>,
    primary_key: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DescriptorColumn {
    name: String,
    data_type: String,
}

/// `read_csv_auto` source expression over the full file set, unioned by name.
fn read_csv_expr(files: &[PathBuf]) -> String {
    let paths = files
        .iter()
        .map(|p| quote_literal(&p.display().to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("read_csv_auto([{paths}], union_by_name=true, files_to_sniff=-1, nullstr='')")
}

fn create_table_sql(schema: &str, table: &str, inferred: &TableSchema, keys: &[&str]) -> String {
    let mut lines: Vec<String> = inferred
        .columns
        .iter()
        .map(|c| format!("  {} {}", quote_ident(&c.name), c.ty.storage_type()))
        .collect();
    lines.push(format!(
        "  PRIMARY KEY ({})",
        keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ")
    ));
    format!(
        "CREATE OR REPLACE TABLE {}.{} (\n{}\n);",
        quote_ident(schema),
        quote_ident(table),
        lines.join(",\n")
    )
}

/// SELECT list aligned to the live table: every column cast to its declared
/// storage type; columns the files never carried become typed NULLs.
fn select_columns(table_columns: &[(String, String)], inferred: &TableSchema) -> String {
    table_columns
        .iter()
        .map(|(name, data_type)| {
            if inferred.contains(name) {
                format!("CAST(n.{id} AS {data_type}) AS {id}", id = quote_ident(name))
            } else {
                format!("CAST(NULL AS {data_type}) AS {id}", id = quote_ident(name))
            }
        })
        .collect::<Vec<_>>()
        .join(",\n  ")
}

fn anti_join_clause(
    schema: &str,
    table: &str,
    table_columns: &[(String, String)],
    keys: &[&str],
) -> String {
    let conditions = keys
        .iter()
        .map(|key| {
            let target_type = table_columns
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, ty)| ty.as_str())
                .unwrap_or("VARCHAR");
            format!(
                "CAST(n.{id} AS {target_type}) = t.{id}",
                id = quote_ident(key)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "LEFT JOIN {}.{} t ON {}",
        quote_ident(schema),
        quote_ident(table),
        conditions
    )
}

/// Rows with a NULL key component can never anti-join and would be
/// re-inserted on every run; they are dropped on append paths.
fn key_not_null_filter(keys: &[&str]) -> String {
    keys.iter()
        .map(|key| format!("n.{} IS NOT NULL", quote_ident(key)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[allow(clippy::too_many_arguments)]
fn count_missing_sql(
    schema: &str,
    table: &str,
    table_columns: &[(String, String)],
    keys: &[&str],
    csv_expr: &str,
    anti_join: bool,
    filter_null_keys: bool,
) -> String {
    let mut sql = format!("SELECT COUNT(*) FROM {csv_expr} n");
    if anti_join {
        sql.push_str(&format!(
            "\n{}\nWHERE t.{} IS NULL AND {}",
            anti_join_clause(schema, table, table_columns, keys),
            quote_ident(keys[0]),
            key_not_null_filter(keys),
        ));
    } else if filter_null_keys {
        sql.push_str(&format!("\nWHERE {}", key_not_null_filter(keys)));
    }
    sql
}

#[allow(clippy::too_many_arguments)]
fn insert_sql(
    schema: &str,
    table: &str,
    table_columns: &[(String, String)],
    inferred: &TableSchema,
    keys: &[&str],
    csv_expr: &str,
    anti_join: bool,
    filter_null_keys: bool,
) -> String {
    let mut sql = format!(
        "INSERT INTO {}.{}\nSELECT\n  {}\nFROM {csv_expr} n",
        quote_ident(schema),
        quote_ident(table),
        select_columns(table_columns, inferred),
    );
    if anti_join {
        sql.push_str(&format!(
            "\n{}\nWHERE t.{} IS NULL AND {}",
            anti_join_clause(schema, table, table_columns, keys),
            quote_ident(keys[0]),
            key_not_null_filter(keys),
        ));
    } else if filter_null_keys {
        sql.push_str(&format!("\nWHERE {}", key_not_null_filter(keys)));
    }
    sql.push(';');
    sql
}

/// List the CSV inputs for a family under the flat-file root, path-sorted.
pub fn family_files(store: &boxsync_store::FlatFileStore, family: TableFamily) -> Result<Vec<PathBuf>> {
    let dir: PathBuf = match family {
        TableFamily::Stats(kind, category) => store.stat_dir(kind, category),
        TableFamily::Log => store.log_dir(),
        TableFamily::Lines => store.lines_dir(),
    };
    boxsync_store::FlatFileStore::csv_files_in(dir.as_path())
}
