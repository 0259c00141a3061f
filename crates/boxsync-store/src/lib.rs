//! Per-season CSV flat-file store: path convention, header-on-create, and
//! composite-key de-duplication before every append.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use boxsync_core::{EntityKind, GameId, Season, StatCategory};
use boxsync_provider::TabularRows;
use tracing::warn;

/// Outcome of one dedup-append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    pub created: bool,
    pub written: usize,
    pub skipped_existing: usize,
}

#[derive(Debug, Clone)]
pub struct FlatFileStore {
    root: PathBuf,
}

impl FlatFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stat_dir(&self, kind: EntityKind, category: StatCategory) -> PathBuf {
        self.root.join(kind.as_str()).join(category.as_str())
    }

    /// `{root}/{teams|players}/{category}/{category}{season}.csv`
    pub fn stat_file(&self, kind: EntityKind, category: StatCategory, season: &Season) -> PathBuf {
        self.stat_dir(kind, category)
            .join(format!("{}{}.csv", category.as_str(), season.label()))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    /// `{root}/log/log{season}.csv`
    pub fn log_file(&self, season: &Season) -> PathBuf {
        self.log_dir().join(format!("log{}.csv", season.label()))
    }

    pub fn lines_dir(&self) -> PathBuf {
        self.root.join("lines")
    }

    /// CSV files directly under `dir`, path-sorted for deterministic SQL.
    /// A missing directory is just an empty listing.
    pub fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("reading directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Append rows to a per-season file, writing the header on first write and
    /// skipping rows whose composite key already exists in the file.
    pub fn append_rows(
        &self,
        path: &Path,
        rows: &TabularRows,
        key_columns: &[&str],
    ) -> Result<AppendOutcome> {
        if rows.is_empty() {
            return Ok(AppendOutcome::default());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        if !path.exists() {
            let mut writer = csv::Writer::from_path(path)
                .with_context(|| format!("creating {}", path.display()))?;
            writer
                .write_record(&rows.headers)
                .with_context(|| format!("writing header to {}", path.display()))?;
            for row in &rows.rows {
                writer
                    .write_record(row)
                    .with_context(|| format!("writing row to {}", path.display()))?;
            }
            writer.flush().with_context(|| format!("flushing {}", path.display()))?;
            return Ok(AppendOutcome {
                created: true,
                written: rows.rows.len(),
                skipped_existing: 0,
            });
        }

        let existing_header = read_header(path)?;
        let existing_keys = read_composite_keys(path, key_columns)?;

        // Existing files dictate column order; incoming rows are aligned by
        // name so header drift between provider versions cannot shear columns.
        let mapping: Vec<Option<usize>> = existing_header
            .iter()
            .map(|name| rows.column_index(name))
            .collect();
        let dropped: Vec<&str> = rows
            .headers
            .iter()
            .filter(|h| !existing_header.iter().any(|e| e == *h))
            .map(String::as_str)
            .collect();
        if !dropped.is_empty() {
            warn!(path = %path.display(), columns = ?dropped, "incoming columns absent from existing file; dropping");
        }

        let key_indices = key_indices(&rows.headers, key_columns, path)?;

        let file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("opening {} for append", path.display()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        let mut outcome = AppendOutcome::default();
        for row in &rows.rows {
            let key = composite_key(row, &key_indices, key_columns);
            if existing_keys.contains(&key) {
                outcome.skipped_existing += 1;
                continue;
            }
            let aligned: Vec<&str> = mapping
                .iter()
                .map(|idx| idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or(""))
                .collect();
            writer
                .write_record(&aligned)
                .with_context(|| format!("appending row to {}", path.display()))?;
            outcome.written += 1;
        }
        writer.flush().with_context(|| format!("flushing {}", path.display()))?;
        Ok(outcome)
    }

    /// Normalized game ids present in one file's identifier column.
    pub fn read_game_ids(&self, path: &Path, column: &str) -> Result<BTreeSet<GameId>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?;
        let Some(idx) = headers.iter().position(|h| h == column) else {
            anyhow::bail!("column {column} absent from {}", path.display());
        };

        let mut ids = BTreeSet::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("reading row of {}", path.display()))?;
            if let Some(value) = record.get(idx) {
                if !value.trim().is_empty() {
                    ids.insert(GameId::normalize(value));
                }
            }
        }
        Ok(ids)
    }

    /// Overwrite the season's authoritative log file with a fresh index.
    pub fn write_log(&self, season: &Season, rows: &TabularRows) -> Result<()> {
        let path = self.log_file(season);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut writer =
            csv::Writer::from_path(&path).with_context(|| format!("creating {}", path.display()))?;
        writer
            .write_record(&rows.headers)
            .with_context(|| format!("writing header to {}", path.display()))?;
        for row in &rows.rows {
            writer
                .write_record(row)
                .with_context(|| format!("writing row to {}", path.display()))?;
        }
        writer.flush().with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }
}

/// Read a whole CSV file into memory. Schema inference samples files this way.
pub fn read_csv(path: &Path) -> Result<TabularRows> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("reading row of {}", path.display()))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(TabularRows { headers, rows })
}

fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect())
}

fn key_indices(headers: &[String], key_columns: &[&str], path: &Path) -> Result<Vec<usize>> {
    key_columns
        .iter()
        .map(|key| {
            headers
                .iter()
                .position(|h| h == key)
                .with_context(|| format!("key column {key} absent from rows for {}", path.display()))
        })
        .collect()
}

/// Key tuples already present in a file, normalized component-wise.
pub fn read_composite_keys(path: &Path, key_columns: &[&str]) -> Result<BTreeSet<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let indices = key_indices(&headers, key_columns, path)?;

    let mut keys = BTreeSet::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("reading row of {}", path.display()))?;
        let row: Vec<String> = record.iter().map(str::to_string).collect();
        keys.insert(composite_key(&row, &indices, key_columns));
    }
    Ok(keys)
}

fn composite_key(row: &[String], indices: &[usize], key_columns: &[&str]) -> Vec<String> {
    indices
        .iter()
        .zip(key_columns)
        .map(|(idx, column)| {
            normalize_key_component(column, row.get(*idx).map(String::as_str).unwrap_or(""))
        })
        .collect()
}

/// Game ids normalize to the fixed-width form; numeric ids shed the `.0`
/// suffix some writers leave on integer columns.
fn normalize_key_component(column: &str, value: &str) -> String {
    let trimmed = value.trim();
    if column == "GAME_ID" {
        return GameId::normalize(trimmed).as_str().to_string();
    }
    match trimmed.strip_suffix(".0") {
        Some(head) if head.parse::<i64>().is_ok() => head.to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn team_rows() -> TabularRows {
        TabularRows {
            headers: vec!["GAME_ID".into(), "TEAM_ID".into(), "PTS".into()],
            rows: vec![
                vec!["0022400001".into(), "1610612737".into(), "110".into()],
                vec!["0022400001".into(), "1610612738".into(), "98".into()],
            ],
        }
    }

    #[test]
    fn first_write_creates_file_with_header() {
        let dir = tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path());
        let season = Season::new("2024-25");
        let path = store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season);

        let outcome = store
            .append_rows(&path, &team_rows(), &["GAME_ID", "TEAM_ID"])
            .expect("append");
        assert!(outcome.created);
        assert_eq!(outcome.written, 2);

        let content = fs::read_to_string(&path).expect("read");
        assert!(content.starts_with("GAME_ID,TEAM_ID,PTS"));
    }

    #[test]
    fn second_append_skips_existing_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path());
        let season = Season::new("2024-25");
        let path = store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season);
        let rows = team_rows();

        store.append_rows(&path, &rows, &["GAME_ID", "TEAM_ID"]).expect("first");
        let second = store.append_rows(&path, &rows, &["GAME_ID", "TEAM_ID"]).expect("second");

        assert_eq!(second.written, 0);
        assert_eq!(second.skipped_existing, 2);
    }

    #[test]
    fn dedup_matches_unpadded_against_padded_game_ids() {
        let dir = tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path());
        let season = Season::new("2024-25");
        let path = store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season);

        store.append_rows(&path, &team_rows(), &["GAME_ID", "TEAM_ID"]).expect("first");

        let unpadded = TabularRows {
            headers: vec!["GAME_ID".into(), "TEAM_ID".into(), "PTS".into()],
            rows: vec![vec!["22400001".into(), "1610612737".into(), "110".into()]],
        };
        let outcome = store
            .append_rows(&path, &unpadded, &["GAME_ID", "TEAM_ID"])
            .expect("append");
        assert_eq!(outcome.skipped_existing, 1);
    }

    #[test]
    fn incoming_rows_align_to_existing_header() {
        let dir = tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path());
        let season = Season::new("2024-25");
        let path = store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season);

        store.append_rows(&path, &team_rows(), &["GAME_ID", "TEAM_ID"]).expect("first");

        // Provider reordered columns and grew a new one.
        let drifted = TabularRows {
            headers: vec!["PTS".into(), "GAME_ID".into(), "TEAM_ID".into(), "REB".into()],
            rows: vec![vec!["120".into(), "0022400002".into(), "1610612737".into(), "44".into()]],
        };
        store.append_rows(&path, &drifted, &["GAME_ID", "TEAM_ID"]).expect("append");

        let content = fs::read_to_string(&path).expect("read");
        let last = content.lines().last().expect("last line");
        assert_eq!(last, "0022400002,1610612737,120");
    }

    #[test]
    fn read_game_ids_normalizes() {
        let dir = tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path());
        let season = Season::new("2024-25");
        let path = store.log_file(&season);

        let rows = TabularRows {
            headers: vec!["GAME_ID".into(), "TEAM_ID".into()],
            rows: vec![
                vec!["22400001".into(), "1".into()],
                vec!["0022400001".into(), "2".into()],
            ],
        };
        store.write_log(&season, &rows).expect("write log");

        let ids = store.read_game_ids(&path, "GAME_ID").expect("read");
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&GameId::normalize("0022400001")));
    }
}
