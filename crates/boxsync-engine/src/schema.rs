//! Schema inference from sampled CSV data.
//!
//! Pure functions only: the elementary-type-to-storage-type mapping is a
//! fixed lookup applied identically on every invocation, so re-running a
//! build always derives the same table definition.

use std::path::PathBuf;

use anyhow::{Context, Result};
use boxsync_provider::TabularRows;

/// Storage types the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Text,
    Date,
}

impl ColumnType {
    pub fn storage_type(self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Union-by-name merge: columns unknown to `self` are appended in the
    /// other schema's order.
    pub fn merge_missing(&mut self, other: &TableSchema) {
        for column in &other.columns {
            if !self.contains(&column.name) {
                self.columns.push(column.clone());
            }
        }
    }
}

/// Infer the elementary type of one column from its non-empty values.
/// No evidence at all degrades to text.
pub fn infer_column_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut saw_value = false;
    let mut all_int = true;
    let mut all_float = true;
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        saw_value = true;
        if all_int && trimmed.parse::<i64>().is_err() {
            all_int = false;
        }
        if all_float && trimmed.parse::<f64>().is_err() {
            all_float = false;
        }
        if !all_int && !all_float {
            break;
        }
    }
    if !saw_value {
        ColumnType::Text
    } else if all_int {
        ColumnType::BigInt
    } else if all_float {
        ColumnType::Double
    } else {
        ColumnType::Text
    }
}

/// Columns carrying `DATE` in their name are dates no matter what the sample
/// looked like; provider date fields are strings that would otherwise infer
/// as text.
fn apply_name_override(name: &str, inferred: ColumnType) -> ColumnType {
    if name.contains("DATE") {
        ColumnType::Date
    } else {
        inferred
    }
}

/// Infer a full table schema from one sampled file's rows.
pub fn infer_schema(sample: &TabularRows) -> TableSchema {
    let columns = sample
        .headers
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let inferred =
                infer_column_type(sample.rows.iter().filter_map(|row| row.get(idx)).map(String::as_str));
            Column {
                name: name.clone(),
                ty: apply_name_override(name, inferred),
            }
        })
        .collect();
    TableSchema { columns }
}

/// Infer the unioned schema of a set of delimited files.
///
/// The representative file (widest header; ties broken by the caller's path
/// order) is read fully; columns appearing only in other files are merged in
/// by name so the result covers the union of all inputs.
pub fn infer_unioned_schema(files: &[PathBuf]) -> Result<TableSchema> {
    anyhow::ensure!(!files.is_empty(), "no source files to infer a schema from");

    let mut widths = Vec::with_capacity(files.len());
    for path in files {
        let rows = boxsync_store::read_csv(path)
            .with_context(|| format!("sampling {}", path.display()))?;
        widths.push((rows.headers.len(), rows));
    }

    let representative = widths
        .iter()
        .enumerate()
        .max_by(|(ia, (wa, _)), (ib, (wb, _))| wa.cmp(wb).then(ib.cmp(ia)))
        .map(|(idx, _)| idx)
        .unwrap_or(0);

    let mut schema = infer_schema(&widths[representative].1);
    for (idx, (_, rows)) in widths.iter().enumerate() {
        if idx == representative {
            continue;
        }
        if rows.headers.iter().any(|h| !schema.contains(h)) {
            schema.merge_missing(&infer_schema(rows));
        }
    }
    Ok(schema)
}
