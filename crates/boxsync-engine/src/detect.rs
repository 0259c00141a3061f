//! Missing-data detection: composite-key set difference between what the
//! authoritative index expects and what a storage substrate holds.
//!
//! Read-only. An unreadable source never fails a detection run; its
//! present-set is empty, which makes everything look missing and lets the
//! collector repair it.

use std::collections::BTreeSet;

use boxsync_core::{EntityKind, GameId, Season, StatCategory, TableFamily};
use boxsync_store::FlatFileStore;
use tracing::warn;

use crate::db::Db;

/// `expected − present`.
pub fn missing_ids(expected: &BTreeSet<GameId>, present: &BTreeSet<GameId>) -> BTreeSet<GameId> {
    expected.difference(present).cloned().collect()
}

/// How the team-level and player-level substrates combine into "processed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletenessMode {
    /// A game counts only once both its team rows and player rows exist.
    RequireBoth,
    /// Each substrate stands alone; a game counts if either holds it.
    PerTable,
}

#[derive(Debug)]
pub struct MissingDataDetector<'a> {
    store: &'a FlatFileStore,
    mode: CompletenessMode,
}

impl<'a> MissingDataDetector<'a> {
    pub fn new(store: &'a FlatFileStore, mode: CompletenessMode) -> Self {
        Self { store, mode }
    }

    /// Normalized ids present in one per-season stat file. Absent or
    /// malformed files yield the empty set.
    pub fn present_in_file(
        &self,
        kind: EntityKind,
        category: StatCategory,
        season: &Season,
    ) -> BTreeSet<GameId> {
        let path = self.store.stat_file(kind, category, season);
        if !path.exists() {
            warn!(path = %path.display(), "stat file absent; treating as empty");
            return BTreeSet::new();
        }
        match self.store.read_game_ids(&path, "GAME_ID") {
            Ok(ids) => ids,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "stat file unreadable; treating as empty");
                BTreeSet::new()
            }
        }
    }

    /// Games considered processed in the flat-file substrate for one
    /// (category, season), combined across entity kinds per the mode.
    pub fn processed_in_files(&self, category: StatCategory, season: &Season) -> BTreeSet<GameId> {
        let teams = self.present_in_file(EntityKind::Teams, category, season);
        let players = self.present_in_file(EntityKind::Players, category, season);
        combine(self.mode, teams, players)
    }

    /// Normalized ids present in one database table. An absent or unreadable
    /// table yields the empty set.
    pub fn present_in_table(&self, db: &Db, schema: &str, kind: EntityKind, category: StatCategory) -> BTreeSet<GameId> {
        let table = TableFamily::Stats(kind, category).table_name();
        match db.table_exists(schema, &table) {
            Ok(true) => {}
            Ok(false) => {
                warn!(schema, table = %table, "table absent; treating as empty");
                return BTreeSet::new();
            }
            Err(err) => {
                warn!(schema, table = %table, error = %err, "table introspection failed; treating as empty");
                return BTreeSet::new();
            }
        }
        match db.distinct_game_ids(schema, &table, "GAME_ID") {
            Ok(ids) => ids,
            Err(err) => {
                warn!(schema, table = %table, error = %err, "table unreadable; treating as empty");
                BTreeSet::new()
            }
        }
    }

    /// Games considered processed in the database substrate for one category,
    /// combined across entity kinds per the mode.
    pub fn processed_in_db(&self, db: &Db, schema: &str, category: StatCategory) -> BTreeSet<GameId> {
        let teams = self.present_in_table(db, schema, EntityKind::Teams, category);
        let players = self.present_in_table(db, schema, EntityKind::Players, category);
        combine(self.mode, teams, players)
    }
}

fn combine(
    mode: CompletenessMode,
    teams: BTreeSet<GameId>,
    players: BTreeSet<GameId>,
) -> BTreeSet<GameId> {
    match mode {
        CompletenessMode::RequireBoth => teams.intersection(&players).cloned().collect(),
        CompletenessMode::PerTable => teams.union(&players).cloned().collect(),
    }
}
