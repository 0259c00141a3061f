//! End-to-end pipeline coverage: union-by-name table builds, append
//! idempotence, failure containment, and the collect → build → combine flow
//! against a real (in-process) database.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use boxsync_core::{EntityKind, GameId, Season, StatCategory, TableFamily};
use boxsync_engine::config::EngineConfig;
use boxsync_engine::db::{Db, SqlAudit};
use boxsync_engine::reconcile::{Reconciler, UnitState};
use boxsync_engine::tables::{BuildMode, TableBuilder};
use boxsync_engine::CompletenessMode;
use boxsync_provider::{BoxScore, GameIndex, ProviderError, StatsSource, TabularRows};
use tempfile::TempDir;

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("write csv");
    path
}

#[test]
fn union_by_name_build_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let narrow = write_file(
        &dir,
        "traditional1999-00.csv",
        "GAME_ID,TEAM_ID,PTS\n0029900001,1610612737,110\n0029900001,1610612738,98\n",
    );
    let wide = write_file(
        &dir,
        "traditional2024-25.csv",
        "GAME_ID,TEAM_ID,PTS,REB\n0022400001,1610612737,105,44\n",
    );

    let db = Db::open_in_memory(SqlAudit::default()).expect("db");
    let builder = TableBuilder::new(&db, "raw", dir.path().join("descriptors"));
    let family = TableFamily::Stats(EntityKind::Teams, StatCategory::Traditional);
    let files = vec![narrow, wide];

    let first = builder
        .build_or_update(family, &files, BuildMode::AppendNewOnly)
        .expect("first build");
    assert!(first.created);
    assert_eq!(first.inserted_rows, 3);
    assert!(first.descriptor_written);

    // Union by name: the table covers both column sets, REB null for rows
    // from the narrow file.
    let columns: Vec<String> = db
        .table_columns("raw", "teams_traditional")
        .expect("columns")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(columns, vec!["GAME_ID", "TEAM_ID", "PTS", "REB"]);
    let null_rebs = db
        .query_count("SELECT COUNT(*) FROM \"raw\".\"teams_traditional\" WHERE \"REB\" IS NULL")
        .expect("null rebs");
    assert_eq!(null_rebs, 2);

    // Re-running with identical inputs inserts nothing and leaves the
    // descriptor alone.
    let second = builder
        .build_or_update(family, &files, BuildMode::AppendNewOnly)
        .expect("second build");
    assert!(!second.created);
    assert_eq!(second.missing_rows, 0);
    assert_eq!(second.inserted_rows, 0);
    assert!(!second.descriptor_written);

    // A new file contributes only its novel rows.
    let extra = write_file(
        &dir,
        "traditional2024-25b.csv",
        "GAME_ID,TEAM_ID,PTS,REB\n0022400001,1610612737,105,44\n0022400002,1610612740,91,38\n",
    );
    let mut files = files;
    files.push(extra);
    let third = builder
        .build_or_update(family, &files, BuildMode::AppendNewOnly)
        .expect("third build");
    assert_eq!(third.inserted_rows, 1);

    let total = db
        .query_count("SELECT COUNT(*) FROM \"raw\".\"teams_traditional\"")
        .expect("total");
    assert_eq!(total, 4);
}

#[test]
fn full_rebuild_replaces_the_table() {
    let dir = TempDir::new().expect("tempdir");
    let first_file = write_file(&dir, "log1.csv", "GAME_ID,TEAM_ID,WL\n0022400001,1,W\n");
    let second_file = write_file(&dir, "log2.csv", "GAME_ID,TEAM_ID,WL\n0022400002,1,L\n");

    let db = Db::open_in_memory(SqlAudit::default()).expect("db");
    let builder = TableBuilder::new(&db, "raw", dir.path().join("descriptors"));

    builder
        .build_or_update(TableFamily::Log, &[first_file], BuildMode::FullRebuild)
        .expect("first rebuild");
    builder
        .build_or_update(TableFamily::Log, &[second_file], BuildMode::FullRebuild)
        .expect("second rebuild");

    // Replaced wholesale, not appended.
    let total = db.query_count("SELECT COUNT(*) FROM \"raw\".\"log_table\"").expect("total");
    assert_eq!(total, 1);
    let wl: Vec<String> = db
        .query_strings("SELECT \"WL\" FROM \"raw\".\"log_table\"")
        .expect("wl");
    assert_eq!(wl, vec!["L"]);
}

#[test]
fn rows_with_null_keys_are_not_reinserted_forever() {
    let dir = TempDir::new().expect("tempdir");
    let file = write_file(
        &dir,
        "traditional2024-25.csv",
        "GAME_ID,TEAM_ID,PLAYER_ID,PTS\n0022400001,1,201939,30\n0022400001,1,,12\n",
    );

    let db = Db::open_in_memory(SqlAudit::default()).expect("db");
    let builder = TableBuilder::new(&db, "raw", dir.path().join("descriptors"));
    let family = TableFamily::Stats(EntityKind::Players, StatCategory::Traditional);

    let first = builder
        .build_or_update(family, &[file.clone()], BuildMode::AppendNewOnly)
        .expect("first");
    assert_eq!(first.inserted_rows, 1);

    let second = builder
        .build_or_update(family, &[file], BuildMode::AppendNewOnly)
        .expect("second");
    assert_eq!(second.inserted_rows, 0);
}

// -- mock provider ----------------------------------------------------------

struct MockSource {
    index: GameIndex,
    scores: BTreeMap<GameId, BoxScore>,
}

#[async_trait::async_trait]
impl StatsSource for MockSource {
    async fn fetch_season_index(&self, _season: &Season) -> Result<GameIndex, ProviderError> {
        Ok(self.index.clone())
    }

    async fn fetch_box_score(
        &self,
        _category: StatCategory,
        game_id: &GameId,
    ) -> Result<BoxScore, ProviderError> {
        self.scores
            .get(game_id)
            .cloned()
            .ok_or_else(|| ProviderError::Permanent(format!("no fixture for {game_id}")))
    }
}

fn rows(headers: &[&str], data: &[&[&str]]) -> TabularRows {
    TabularRows {
        headers: headers.iter().map(|s| s.to_string()).collect(),
        rows: data
            .iter()
            .map(|row| row.iter().map(|s| s.to_string()).collect())
            .collect(),
    }
}

const LOG_HEADERS: &[&str] = &[
    "SEASON_ID",
    "TEAM_ID",
    "TEAM_ABBREVIATION",
    "TEAM_NAME",
    "GAME_ID",
    "GAME_DATE",
    "MATCHUP",
    "WL",
    "MIN",
    "PTS",
    "TOV",
];

fn fixture_source() -> MockSource {
    let log = rows(
        LOG_HEADERS,
        &[
            &["22024", "1610612737", "ATL", "Atlanta Hawks", "0022400001", "2024-10-23", "ATL vs. BOS", "W", "240", "999", "12"],
            &["22024", "1610612738", "BOS", "Boston Celtics", "0022400001", "2024-10-23", "BOS @ ATL", "L", "240", "98", "15"],
            &["22024", "1610612737", "ATL", "Atlanta Hawks", "0022400002", "2024-10-25", "ATL @ NOP", "L", "240", "91", "9"],
            &["22024", "1610612740", "NOP", "New Orleans Pelicans", "0022400002", "2024-10-25", "NOP vs. ATL", "W", "240", "101", "11"],
        ],
    );
    let game_ids = log.column_values("GAME_ID").map(GameId::normalize).collect();

    let mut scores = BTreeMap::new();
    scores.insert(
        GameId::normalize("0022400001"),
        BoxScore {
            teams: rows(
                &["GAME_ID", "TEAM_ID", "TEAM_ABBREVIATION", "MIN", "PTS"],
                &[
                    &["0022400001", "1610612737", "ATL", "240:00", "110"],
                    &["0022400001", "1610612738", "BOS", "240:00", "98"],
                ],
            ),
            players: rows(
                &["GAME_ID", "TEAM_ID", "TEAM_ABBREVIATION", "PLAYER_ID", "PLAYER_NAME", "MIN", "PTS"],
                &[
                    &["0022400001", "1610612737", "ATL", "1629027", "Trae Young", "36:00", "30"],
                    &["0022400001", "1610612738", "BOS", "1628369", "Jayson Tatum", "38:00", "28"],
                ],
            ),
        },
    );
    scores.insert(
        GameId::normalize("0022400002"),
        BoxScore {
            teams: rows(
                &["GAME_ID", "TEAM_ID", "TEAM_ABBREVIATION", "MIN", "PTS"],
                &[
                    &["0022400002", "1610612737", "ATL", "240:00", "91"],
                    &["0022400002", "1610612740", "NOP", "240:00", "101"],
                ],
            ),
            players: rows(
                &["GAME_ID", "TEAM_ID", "TEAM_ABBREVIATION", "PLAYER_ID", "PLAYER_NAME", "MIN", "PTS"],
                &[
                    &["0022400002", "1610612737", "ATL", "1629027", "Trae Young", "34:00", "25"],
                    &["0022400002", "1610612740", "NOP", "1630217", "Zion Williamson", "33:00", "27"],
                ],
            ),
        },
    );

    MockSource {
        index: GameIndex { log, game_ids },
        scores,
    }
}

fn test_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        data_root: dir.path().join("data"),
        database_path: dir.path().join("db/nba.duckdb"),
        sql_root: dir.path().join("sql"),
        descriptor_root: dir.path().join("descriptors"),
        sql_audit_file: Some(dir.path().join("sql_audit.log")),
        seasons: vec![Season::new("2024-25")],
        categories: vec![StatCategory::Traditional],
        completeness: CompletenessMode::RequireBoth,
        fetch_concurrency: 2,
        write_batch: 100,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn collect_then_build_then_combine() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let reconciler = Reconciler::new(config.clone(), Arc::new(fixture_source()));

    // First pass fetches and writes everything.
    let summary = reconciler.collect().await.expect("collect");
    assert_eq!(summary.failures(), 0);
    assert_eq!(summary.units.len(), 1);
    let unit = &summary.units[0];
    assert_eq!(unit.state, UnitState::Written);
    assert_eq!(unit.missing, 2);
    assert_eq!(unit.fetched, 2);
    assert_eq!(unit.team_rows_written, 4);
    assert_eq!(unit.player_rows_written, 4);

    let store = reconciler.store();
    let season = Season::new("2024-25");
    assert!(store.log_file(&season).exists());
    let team_file = store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season);
    let ids = store.read_game_ids(&team_file, "GAME_ID").expect("ids");
    assert_eq!(ids.len(), 2);

    // Second pass finds nothing missing.
    let summary = reconciler.collect().await.expect("second collect");
    assert_eq!(summary.units[0].state, UnitState::Skipped);

    // Drift audit agrees.
    let audit = reconciler.audit().await.expect("audit");
    assert_eq!(audit[0].missing, 0);

    // A truncated season log is repaired on the next pass even though no
    // stat rows are missing.
    let log_path = store.log_file(&season);
    let full_log = std::fs::read_to_string(&log_path).expect("log");
    let truncated: Vec<&str> = full_log.lines().take(3).collect();
    std::fs::write(&log_path, format!("{}\n", truncated.join("\n"))).expect("truncate log");
    let summary = reconciler.collect().await.expect("third collect");
    assert_eq!(summary.units[0].state, UnitState::Skipped);
    let repaired = std::fs::read_to_string(&log_path).expect("repaired log");
    assert_eq!(repaired.lines().count(), full_log.lines().count());

    // Build backing tables from the files.
    let build = reconciler.build_tables(false).expect("build");
    assert_eq!(build.failures, 0);
    let built: Vec<&str> = build.reports.iter().map(|r| r.table.as_str()).collect();
    assert!(built.contains(&"log_table"));
    assert!(built.contains(&"teams_traditional"));
    assert!(built.contains(&"players_traditional"));

    // Rebuilding appends nothing new.
    let again = reconciler.build_tables(false).expect("rebuild");
    assert_eq!(again.failures, 0);
    for report in again.reports.iter().filter(|r| r.table != "log_table") {
        assert_eq!(report.inserted_rows, 0, "table {} grew on re-run", report.table);
    }

    // Combine and verify coalescing precedence end to end.
    let combined = reconciler.combine().expect("combine");
    assert_eq!(combined.len(), 2);
    assert!(combined.iter().all(|c| c.sql_path.exists()));

    let db = Db::open(&config.database_path, SqlAudit::default()).expect("reopen");
    let team_rows = db
        .query_count("SELECT COUNT(*) FROM \"base\".\"teams_combined\"")
        .expect("teams_combined");
    assert_eq!(team_rows, 4);

    // PTS exists in both the log and the stat table; the log wins precedence.
    let log_pts = db
        .query_count(
            "SELECT COUNT(*) FROM \"base\".\"teams_combined\" \
             WHERE \"PTS\" = 999 AND \"TEAM_ABBREVIATION\" = 'ATL'",
        )
        .expect("coalesced pts");
    assert_eq!(log_pts, 1);

    let player_rows = db
        .query_count("SELECT COUNT(*) FROM \"base\".\"players_combined\"")
        .expect("players_combined");
    assert_eq!(player_rows, 4);

    // TOV is excluded at player grain, kept at team grain.
    let player_columns: Vec<String> = db
        .table_columns("base", "players_combined")
        .expect("player columns")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(!player_columns.contains(&"TOV".to_string()));
    let team_columns: Vec<String> = db
        .table_columns("base", "teams_combined")
        .expect("team columns")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(team_columns.contains(&"TOV".to_string()));

    // Every mutating statement landed on the audit channel.
    let audit_log = std::fs::read_to_string(dir.path().join("sql_audit.log")).expect("audit log");
    assert!(audit_log.contains("CREATE SCHEMA \"raw\";"));
    assert!(audit_log.contains("CREATE OR REPLACE TABLE \"base\".\"teams_combined\""));
    drop(db);

    // A new game lands in the flat files only; update-db reconciles it into
    // the backing tables without touching rows already present.
    let new_teams = rows(
        &["GAME_ID", "TEAM_ID", "TEAM_ABBREVIATION", "MIN", "PTS"],
        &[
            &["0022400003", "1610612737", "ATL", "240:00", "120"],
            &["0022400003", "1610612738", "BOS", "240:00", "115"],
        ],
    );
    let new_players = rows(
        &["GAME_ID", "TEAM_ID", "TEAM_ABBREVIATION", "PLAYER_ID", "PLAYER_NAME", "MIN", "PTS"],
        &[
            &["0022400003", "1610612737", "ATL", "1629027", "Trae Young", "35:00", "41"],
            &["0022400003", "1610612738", "BOS", "1628369", "Jayson Tatum", "37:00", "39"],
        ],
    );
    store
        .append_rows(&team_file, &new_teams, &["GAME_ID", "TEAM_ID"])
        .expect("append new teams");
    store
        .append_rows(
            &store.stat_file(EntityKind::Players, StatCategory::Traditional, &season),
            &new_players,
            &["GAME_ID", "PLAYER_ID"],
        )
        .expect("append new players");

    let updates = reconciler.update_database().expect("update-db");
    assert!(updates.iter().all(|r| r.error.is_none()));
    let inserted: i64 = updates
        .iter()
        .flat_map(|r| r.tables.iter())
        .map(|t| t.inserted_rows)
        .sum();
    assert_eq!(inserted, 4);

    let db = Db::open(&config.database_path, SqlAudit::default()).expect("reopen after update");
    let total = db
        .query_count("SELECT COUNT(*) FROM \"raw\".\"teams_traditional\"")
        .expect("total teams");
    assert_eq!(total, 6);
}

#[test]
fn one_bad_category_does_not_abort_the_rest() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(&dir);
    config.categories = vec![StatCategory::Traditional, StatCategory::Misc];
    let reconciler = Reconciler::new(config, Arc::new(fixture_source()));
    let store = reconciler.store();
    let season = Season::new("2024-25");

    store
        .write_log(
            &season,
            &rows(
                LOG_HEADERS,
                &[&["22024", "1610612737", "ATL", "Atlanta Hawks", "0022400001", "2024-10-23", "ATL vs. BOS", "W", "240", "110", "12"]],
            ),
        )
        .expect("log");

    let teams = rows(
        &["GAME_ID", "TEAM_ID", "PTS"],
        &[&["0022400001", "1610612737", "110"]],
    );
    let players = rows(
        &["GAME_ID", "TEAM_ID", "PLAYER_ID", "PTS"],
        &[&["0022400001", "1610612737", "1629027", "30"]],
    );
    for category in [StatCategory::Traditional, StatCategory::Misc] {
        store
            .append_rows(
                &store.stat_file(EntityKind::Players, category, &season),
                &players,
                &["GAME_ID", "PLAYER_ID"],
            )
            .expect("players");
    }
    store
        .append_rows(
            &store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season),
            &teams,
            &["GAME_ID", "TEAM_ID"],
        )
        .expect("teams traditional");

    // The misc team file lacks its TEAM_ID key column entirely.
    let bad = store.stat_file(EntityKind::Teams, StatCategory::Misc, &season);
    std::fs::create_dir_all(bad.parent().expect("parent")).expect("dirs");
    std::fs::write(&bad, "GAME_ID,PTS\n0022400001,110\n").expect("bad file");

    let summary = reconciler.build_tables(false).expect("build");
    assert_eq!(summary.failures, 1);
    let built: Vec<&str> = summary.reports.iter().map(|r| r.table.as_str()).collect();
    assert!(built.contains(&"log_table"));
    assert!(built.contains(&"teams_traditional"));
    assert!(built.contains(&"players_traditional"));
    assert!(built.contains(&"players_misc"));
    assert!(!built.contains(&"teams_misc"));
}

#[test]
fn build_tables_contains_per_table_failures() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let reconciler = Reconciler::new(config, Arc::new(fixture_source()));
    let store = reconciler.store();

    // Stat files exist for both grains, but there are no log files at all.
    let season = Season::new("2024-25");
    let teams = rows(
        &["GAME_ID", "TEAM_ID", "PTS"],
        &[&["0022400001", "1610612737", "110"]],
    );
    let players = rows(
        &["GAME_ID", "TEAM_ID", "PLAYER_ID", "PTS"],
        &[&["0022400001", "1610612737", "1629027", "30"]],
    );
    store
        .append_rows(
            &store.stat_file(EntityKind::Teams, StatCategory::Traditional, &season),
            &teams,
            &["GAME_ID", "TEAM_ID"],
        )
        .expect("teams");
    store
        .append_rows(
            &store.stat_file(EntityKind::Players, StatCategory::Traditional, &season),
            &players,
            &["GAME_ID", "PLAYER_ID"],
        )
        .expect("players");

    let summary = reconciler.build_tables(false).expect("build");
    // Exactly one failure (the log table); the stat tables still built.
    assert_eq!(summary.failures, 1);
    let built: Vec<&str> = summary.reports.iter().map(|r| r.table.as_str()).collect();
    assert!(built.contains(&"teams_traditional"));
    assert!(built.contains(&"players_traditional"));
}
