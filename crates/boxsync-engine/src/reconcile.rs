//! Run orchestration: drives fetch, detection, flat-file writes, database
//! mirroring, table builds, and combined-table generation across every
//! (season, category) unit, containing per-unit failures.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use boxsync_core::{EntityKind, Season, StatCategory, TableFamily};
use boxsync_provider::{GameIndex, StatsSource, TabularRows};
use boxsync_store::FlatFileStore;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::{Db, SqlAudit};
use crate::detect::{missing_ids, MissingDataDetector};
use crate::sqlgen::{
    generate_unified_query, players_profile, quote_ident, teams_profile, ColumnSources,
    EntityProfile,
};
use crate::tables::{family_files, BuildMode, TableBuilder, TableReport};

/// Per-unit lifecycle:
/// `Pending → Fetched → DetectedMissing → {Writing → Written | Skipped} → Done`.
/// A unit that fails mid-write records `Failed` and is retried on the next
/// full run, never within the same run. Reports keep the most informative
/// terminal label (`Skipped`, `Written`, `Done`, or `Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Fetched,
    DetectedMissing,
    Writing,
    Written,
    Skipped,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub season: Season,
    pub category: StatCategory,
    pub state: UnitState,
    pub missing: usize,
    pub fetched: usize,
    pub empty_games: usize,
    pub skipped_games: usize,
    pub team_rows_written: usize,
    pub player_rows_written: usize,
    pub error: Option<String>,
}

impl UnitReport {
    fn new(season: Season, category: StatCategory) -> Self {
        Self {
            season,
            category,
            state: UnitState::Pending,
            missing: 0,
            fetched: 0,
            empty_games: 0,
            skipped_games: 0,
            team_rows_written: 0,
            player_rows_written: 0,
            error: None,
        }
    }

    fn failed(season: Season, category: StatCategory, error: String) -> Self {
        let mut report = Self::new(season, category);
        report.fail(error);
        report
    }

    fn fail(&mut self, error: String) {
        self.state = UnitState::Failed;
        self.error = Some(error);
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitReport>,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.units.iter().filter(|u| u.state == UnitState::Failed).count()
    }

    /// Failures plus individually skipped records; a run with issues still
    /// exits cleanly.
    pub fn issues(&self) -> usize {
        self.failures() + self.units.iter().map(|u| u.skipped_games).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub category: StatCategory,
    pub tables: Vec<TableReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub reports: Vec<TableReport>,
    pub failures: usize,
}

#[derive(Debug, Clone)]
pub struct CombineReport {
    pub output_table: String,
    pub sql_path: PathBuf,
}

pub struct Reconciler {
    config: EngineConfig,
    store: FlatFileStore,
    source: Arc<dyn StatsSource>,
}

impl Reconciler {
    pub fn new(config: EngineConfig, source: Arc<dyn StatsSource>) -> Self {
        let store = FlatFileStore::new(config.data_root.clone());
        Self { config, store, source }
    }

    pub fn store(&self) -> &FlatFileStore {
        &self.store
    }

    fn open_db(&self) -> Result<Db> {
        Db::open(
            &self.config.database_path,
            SqlAudit::new(self.config.sql_audit_file.clone()),
        )
    }

    /// Full collection pass: seasons in reverse-chronological order, one
    /// (season, category) unit at a time.
    pub async fn collect(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        // Failing to open the database is the one condition that aborts the
        // whole run.
        let db = self.open_db()?;
        info!(%run_id, seasons = self.config.seasons.len(), "starting collection run");

        let mut units = Vec::new();
        for season in self.config.seasons.iter().rev() {
            let index = match self.source.fetch_season_index(season).await {
                Ok(index) => index,
                Err(err) => {
                    error!(season = %season, error = %err, "season index fetch failed");
                    for category in &self.config.categories {
                        units.push(UnitReport::failed(
                            season.clone(),
                            *category,
                            format!("season index: {err}"),
                        ));
                    }
                    continue;
                }
            };

            if let Err(err) = self.refresh_log(season, &index) {
                error!(season = %season, error = %err, "season log refresh failed");
            }

            for category in &self.config.categories {
                units.push(self.collect_unit(&db, season, *category, &index).await);
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            units,
        };
        info!(
            units = summary.units.len(),
            failures = summary.failures(),
            issues = summary.issues(),
            "collection run complete"
        );
        Ok(summary)
    }

    /// Rewrite the season log file when the fetched index knows games the
    /// file does not; an up-to-date log is left untouched.
    fn refresh_log(&self, season: &Season, index: &GameIndex) -> Result<()> {
        let path = self.store.log_file(season);
        if path.exists() {
            let known = match self.store.read_game_ids(&path, "GAME_ID") {
                Ok(known) => known,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "season log unreadable; rewriting");
                    BTreeSet::new()
                }
            };
            if missing_ids(&index.game_ids, &known).is_empty() {
                info!(season = %season, "season log up to date");
                return Ok(());
            }
        }
        info!(season = %season, "season log out of date; rewriting");
        self.store.write_log(season, &index.log)
    }

    async fn collect_unit(
        &self,
        db: &Db,
        season: &Season,
        category: StatCategory,
        index: &GameIndex,
    ) -> UnitReport {
        let mut report = UnitReport::new(season.clone(), category);
        report.state = UnitState::Fetched;

        let detector = MissingDataDetector::new(&self.store, self.config.completeness);
        let processed = detector.processed_in_files(category, season);
        let missing = missing_ids(&index.game_ids, &processed);
        report.state = UnitState::DetectedMissing;
        report.missing = missing.len();

        if missing.is_empty() {
            info!(season = %season, category = %category, "all data present");
            report.state = UnitState::Skipped;
            return report;
        }

        info!(season = %season, category = %category, missing = missing.len(), "fetching missing games");

        // Bounded fan-out for the network; all writes stay on this task so
        // each destination file and table has a single writer.
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for game_id in &missing {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            let game_id = game_id.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = source.fetch_box_score(category, &game_id).await;
                (game_id, result)
            });
        }

        let mut team_batch: Vec<TabularRows> = Vec::new();
        let mut player_batch: Vec<TabularRows> = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            let (game_id, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "fetch task aborted");
                    report.skipped_games += 1;
                    continue;
                }
            };
            match result {
                Ok(score) if score.is_empty() => {
                    report.empty_games += 1;
                }
                Ok(score) => {
                    report.fetched += 1;
                    team_batch.push(score.teams);
                    player_batch.push(score.players);
                    if team_batch.len() >= self.config.write_batch.max(1) {
                        report.state = UnitState::Writing;
                        if let Err(err) =
                            self.flush_unit(db, season, category, &mut team_batch, &mut player_batch, &mut report)
                        {
                            report.fail(format!("writing batch: {err}"));
                            join_set.abort_all();
                            return report;
                        }
                    }
                }
                Err(err) => {
                    // Transient errors already exhausted their retries inside
                    // the provider; either way the single record is skipped.
                    warn!(game = %game_id, error = %err, "skipping game");
                    report.skipped_games += 1;
                }
            }
        }

        if !team_batch.is_empty() {
            report.state = UnitState::Writing;
            if let Err(err) =
                self.flush_unit(db, season, category, &mut team_batch, &mut player_batch, &mut report)
            {
                report.fail(format!("writing final batch: {err}"));
                return report;
            }
        }

        if report.empty_games > 0 {
            warn!(season = %season, category = %category, empty = report.empty_games, "empty games in index");
        }

        report.state = if report.team_rows_written + report.player_rows_written > 0 {
            UnitState::Written
        } else {
            UnitState::Done
        };
        report
    }

    fn flush_unit(
        &self,
        db: &Db,
        season: &Season,
        category: StatCategory,
        team_batch: &mut Vec<TabularRows>,
        player_batch: &mut Vec<TabularRows>,
        report: &mut UnitReport,
    ) -> Result<()> {
        let teams = merge_tabular(std::mem::take(team_batch));
        let players = merge_tabular(std::mem::take(player_batch));

        let team_family = TableFamily::Stats(EntityKind::Teams, category);
        let player_family = TableFamily::Stats(EntityKind::Players, category);
        let team_path = self.store.stat_file(EntityKind::Teams, category, season);
        let player_path = self.store.stat_file(EntityKind::Players, category, season);

        let team_outcome = self
            .store
            .append_rows(&team_path, &teams, team_family.key_columns())
            .context("appending team rows")?;
        let player_outcome = self
            .store
            .append_rows(&player_path, &players, player_family.key_columns())
            .context("appending player rows")?;
        report.team_rows_written += team_outcome.written;
        report.player_rows_written += player_outcome.written;
        info!(
            season = %season,
            category = %category,
            team_rows = team_outcome.written,
            player_rows = player_outcome.written,
            "flushed batch to flat files"
        );

        self.mirror_into_db(db, team_family, &team_path)
            .context("mirroring team rows")?;
        self.mirror_into_db(db, player_family, &player_path)
            .context("mirroring player rows")?;
        Ok(())
    }

    /// Append the season file's novel rows into the backing table, when one
    /// exists. Table creation belongs to `build_tables`, not the collector.
    fn mirror_into_db(&self, db: &Db, family: TableFamily, season_file: &Path) -> Result<()> {
        let table = family.table_name();
        if !db.table_exists(&self.config.raw_schema, &table)? {
            warn!(table = %table, "no backing table; skipping database mirror");
            return Ok(());
        }
        let builder = TableBuilder::new(db, self.config.raw_schema.clone(), self.config.descriptor_root.clone());
        let report =
            builder.build_or_update(family, &[season_file.to_path_buf()], BuildMode::AppendNewOnly)?;
        if report.inserted_rows > 0 {
            info!(table = %report.table, inserted = report.inserted_rows, "mirrored rows into database");
        }
        Ok(())
    }

    /// Standalone drift audit: report missing counts per unit without
    /// fetching any box scores.
    pub async fn audit(&self) -> Result<Vec<UnitReport>> {
        let detector = MissingDataDetector::new(&self.store, self.config.completeness);
        let mut units = Vec::new();
        for season in &self.config.seasons {
            let index = match self.source.fetch_season_index(season).await {
                Ok(index) => index,
                Err(err) => {
                    error!(season = %season, error = %err, "season index fetch failed");
                    for category in &self.config.categories {
                        units.push(UnitReport::failed(
                            season.clone(),
                            *category,
                            format!("season index: {err}"),
                        ));
                    }
                    continue;
                }
            };
            for category in &self.config.categories {
                let mut report = UnitReport::new(season.clone(), *category);
                let processed = detector.processed_in_files(*category, season);
                report.missing = missing_ids(&index.game_ids, &processed).len();
                report.state = UnitState::Done;
                if report.missing > 0 {
                    info!(season = %season, category = %category, missing = report.missing, "missing games");
                } else {
                    info!(season = %season, category = %category, "all data present");
                }
                units.push(report);
            }
        }
        Ok(units)
    }

    /// Reconcile flat files into the database: per category, insert rows
    /// present in files but absent from the backing tables.
    pub fn update_database(&self) -> Result<Vec<UpdateReport>> {
        let db = self.open_db()?;
        let builder = TableBuilder::new(
            &db,
            self.config.raw_schema.clone(),
            self.config.descriptor_root.clone(),
        );

        let mut reports = Vec::new();
        for category in &self.config.categories {
            let mut report = UpdateReport {
                category: *category,
                tables: Vec::new(),
                error: None,
            };

            // Both grains must already be backed by tables.
            let absent = EntityKind::ALL.into_iter().find(|kind| {
                let table = TableFamily::Stats(*kind, *category).table_name();
                !db.table_exists(&self.config.raw_schema, &table).unwrap_or(false)
            });
            if let Some(kind) = absent {
                let table = TableFamily::Stats(kind, *category).table_name();
                error!(category = %category, table = %table, "no backing table; skipping category");
                report.error = Some(format!("no backing table {table}"));
                reports.push(report);
                continue;
            }

            for kind in EntityKind::ALL {
                let family = TableFamily::Stats(kind, *category);
                let files = match family_files(&self.store, family) {
                    Ok(files) => files,
                    Err(err) => {
                        error!(category = %category, kind = %kind, error = %err, "listing files failed");
                        report.error = Some(err.to_string());
                        continue;
                    }
                };
                if files.is_empty() {
                    warn!(category = %category, kind = %kind, "no csv files to reconcile");
                    continue;
                }
                match builder.build_or_update(family, &files, BuildMode::AppendNewOnly) {
                    Ok(table_report) => {
                        if table_report.inserted_rows > 0 {
                            info!(
                                table = %table_report.table,
                                inserted = table_report.inserted_rows,
                                "inserted missing rows"
                            );
                        }
                        report.tables.push(table_report);
                    }
                    Err(err) => {
                        error!(category = %category, kind = %kind, error = %err, "update failed");
                        report.error = Some(err.to_string());
                    }
                }
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// (Re)build backing tables from the flat-file substrate. The log table
    /// is always a full rebuild; stat tables append unless `rebuild_stats`.
    pub fn build_tables(&self, rebuild_stats: bool) -> Result<BuildSummary> {
        let db = self.open_db()?;
        let builder = TableBuilder::new(
            &db,
            self.config.raw_schema.clone(),
            self.config.descriptor_root.clone(),
        );
        db.ensure_schema(&self.config.raw_schema)?;

        let mut summary = BuildSummary::default();
        let mut build = |family: TableFamily, mode: BuildMode, required: bool| {
            match family_files(&self.store, family) {
                Ok(files) if files.is_empty() => {
                    if required {
                        error!(table = %family.table_name(), "no csv files found");
                        summary.failures += 1;
                    } else {
                        info!(table = %family.table_name(), "no csv files; skipping");
                    }
                }
                Ok(files) => match builder.build_or_update(family, &files, mode) {
                    Ok(report) => {
                        info!(
                            table = %report.table,
                            inserted = report.inserted_rows,
                            created = report.created,
                            "built table"
                        );
                        summary.reports.push(report);
                    }
                    Err(err) => {
                        error!(table = %family.table_name(), error = %err, "table build failed");
                        summary.failures += 1;
                    }
                },
                Err(err) => {
                    error!(table = %family.table_name(), error = %err, "listing files failed");
                    summary.failures += 1;
                }
            }
        };

        build(TableFamily::Log, BuildMode::FullRebuild, true);
        build(TableFamily::Lines, BuildMode::FullRebuild, false);

        let stat_mode = if rebuild_stats {
            BuildMode::FullRebuild
        } else {
            BuildMode::AppendNewOnly
        };
        for kind in EntityKind::ALL {
            for category in &self.config.categories {
                build(TableFamily::Stats(kind, *category), stat_mode, true);
            }
        }

        info!(
            tables = summary.reports.len(),
            failures = summary.failures,
            "finished building tables"
        );
        Ok(summary)
    }

    /// Generate and materialize the unified team/player tables.
    pub fn combine(&self) -> Result<Vec<CombineReport>> {
        let db = self.open_db()?;
        let mut reports = Vec::new();
        for profile in [teams_profile(), players_profile()] {
            match self.combine_one(&db, &profile) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(output = profile.output_table, error = %err, "combine failed");
                }
            }
        }
        Ok(reports)
    }

    fn combine_one(&self, db: &Db, profile: &EntityProfile) -> Result<CombineReport> {
        let pairs =
            db.columns_for_tables(&self.config.raw_schema, profile.like_pattern, profile.extra_tables)?;
        let sources = ColumnSources::from_pairs(pairs.iter().map(|(t, c)| (t.as_str(), c.as_str())));
        anyhow::ensure!(
            !sources.is_empty(),
            "no source columns found for {}",
            profile.output_table
        );

        let query = generate_unified_query(&self.config.raw_schema, &sources, profile);
        let statement = format!(
            "CREATE OR REPLACE TABLE {}.{} AS\n{}",
            quote_ident(&self.config.combined_schema),
            quote_ident(profile.output_table),
            query.full_sql()
        );

        let sql_dir = self.config.sql_root.join(&self.config.combined_schema);
        std::fs::create_dir_all(&sql_dir)
            .with_context(|| format!("creating {}", sql_dir.display()))?;
        let sql_path = sql_dir.join(format!("{}.sql", profile.output_table));
        std::fs::write(&sql_path, &statement)
            .with_context(|| format!("writing {}", sql_path.display()))?;

        db.ensure_schema(&self.config.combined_schema)?;
        db.execute_logged(&statement)?;
        info!(output = profile.output_table, sql = %sql_path.display(), "materialized combined table");

        Ok(CombineReport {
            output_table: profile.output_table.to_string(),
            sql_path,
        })
    }
}

/// Union a batch of tabular pages by column name; later pages may carry
/// columns earlier ones lack and vice versa.
fn merge_tabular(batches: Vec<TabularRows>) -> TabularRows {
    let mut headers: Vec<String> = Vec::new();
    for batch in &batches {
        for header in &batch.headers {
            if !headers.contains(header) {
                headers.push(header.clone());
            }
        }
    }

    let mut rows = Vec::new();
    for batch in batches {
        let TabularRows { headers: batch_headers, rows: batch_rows } = batch;
        let mapping: Vec<Option<usize>> = headers
            .iter()
            .map(|h| batch_headers.iter().position(|bh| bh == h))
            .collect();
        for row in batch_rows {
            rows.push(
                mapping
                    .iter()
                    .map(|idx| idx.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                    .collect(),
            );
        }
    }
    TabularRows { headers, rows }
}
