//! Column-coalescing SQL generation for the unified team/player tables.
//!
//! Several raw tables carry overlapping column sets for the same stat line;
//! this module resolves, per output column, which tables supply the value and
//! in what order, then emits a `SELECT DISTINCT` with `COALESCE`/cast
//! expressions over a left-join chain anchored at the authoritative log
//! table. No I/O happens here; callers execute the emitted text.
//!
//! Output is deterministic to the byte: columns iterate in sorted order, the
//! join chain sorts contributing tables by name, and precedence sorting is
//! stable so unlisted tables keep their registration order.

use std::collections::{BTreeMap, BTreeSet};

use boxsync_core::EntityKind;

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn qualified_column(schema: &str, table: &str, column: &str) -> String {
    format!("{}.{}", qualified_table(schema, table), quote_ident(column))
}

fn game_id_key(schema: &str, table: &str) -> String {
    format!("CAST({} AS BIGINT)", qualified_column(schema, table, "GAME_ID"))
}

/// How contributing tables attach to the join chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStyle {
    /// Every contributing table left-joins the anchor directly.
    Anchor { discriminator: &'static str },
    /// The first table joins the anchor; each further table joins the
    /// previous one. The anchor has no player-grain discriminator, so the
    /// player chain hops from table to table.
    Chained {
        first: &'static str,
        rest: &'static str,
    },
}

/// Per-entity coalescing rules.
///
/// The team and player variants differ deliberately (pins, exclusions, cast
/// overrides); the asymmetry is configuration, not code paths.
#[derive(Debug, Clone)]
pub struct EntityProfile {
    pub entity: EntityKind,
    /// Output table name (created under the combined schema).
    pub output_table: &'static str,
    /// LIKE pattern selecting this entity's raw stat tables.
    pub like_pattern: &'static str,
    /// Non-stat tables that also contribute columns.
    pub extra_tables: &'static [&'static str],
    /// The authoritative log table anchoring every join.
    pub anchor: &'static str,
    /// Explicit source-precedence order; unlisted tables sort after listed
    /// ones, keeping registration order among themselves.
    pub precedence: &'static [(&'static str, usize)],
    /// Identifying/dimensional columns hard-pinned to the anchor, overriding
    /// coalescing entirely.
    pub pinned_columns: &'static [&'static str],
    /// Columns dropped from the output for this entity.
    pub excluded_columns: &'static [&'static str],
    /// Columns whose storage types diverge across sources; every coalesce
    /// branch is cast to VARCHAR. A static list, never auto-detected.
    pub cast_to_varchar: &'static [&'static str],
    /// Whether the anchor participates in non-pinned coalesce lists.
    pub anchor_in_coalesce: bool,
    pub join: JoinStyle,
}

impl EntityProfile {
    fn precedence_of(&self, table: &str) -> usize {
        self.precedence
            .iter()
            .find(|(name, _)| *name == table)
            .map(|(_, rank)| *rank)
            .unwrap_or(usize::MAX)
    }

    fn is_pinned(&self, column: &str) -> bool {
        self.pinned_columns.contains(&column)
    }

    fn is_excluded(&self, column: &str) -> bool {
        self.excluded_columns.contains(&column)
    }

    fn casts_to_varchar(&self, column: &str) -> bool {
        self.cast_to_varchar.contains(&column)
    }
}

pub fn teams_profile() -> EntityProfile {
    EntityProfile {
        entity: EntityKind::Teams,
        output_table: "teams_combined",
        like_pattern: "teams_%",
        extra_tables: &["log_table", "lines_table"],
        anchor: "log_table",
        precedence: &[("log_table", 0), ("teams_fourfactors", 1)],
        pinned_columns: &[],
        excluded_columns: &[],
        // GAME_ID is integer-typed in the log but text in the lines table;
        // MIN is "240:00" at team grain and numeric elsewhere.
        cast_to_varchar: &["GAME_ID", "MIN"],
        anchor_in_coalesce: true,
        join: JoinStyle::Anchor {
            discriminator: "TEAM_ABBREVIATION",
        },
    }
}

pub fn players_profile() -> EntityProfile {
    EntityProfile {
        entity: EntityKind::Players,
        output_table: "players_combined",
        like_pattern: "players_%",
        extra_tables: &["log_table"],
        anchor: "log_table",
        precedence: &[("log_table", 0), ("players_fourfactors", 1)],
        pinned_columns: &[
            "SEASON_ID",
            "TEAM_ID",
            "TEAM_ABBREVIATION",
            "TEAM_NAME",
            "GAME_ID",
            "GAME_DATE",
            "MATCHUP",
            "WL",
        ],
        // TOV exists only at team grain in the log; it has no player meaning.
        excluded_columns: &["TOV"],
        cast_to_varchar: &[],
        anchor_in_coalesce: false,
        join: JoinStyle::Chained {
            first: "TEAM_ABBREVIATION",
            rest: "PLAYER_NAME",
        },
    }
}

/// Which tables contain each output column, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ColumnSources {
    map: BTreeMap<String, Vec<String>>,
}

impl ColumnSources {
    pub fn add(&mut self, column: impl Into<String>, table: impl Into<String>) {
        let table = table.into();
        let entry = self.map.entry(column.into()).or_default();
        if !entry.contains(&table) {
            entry.push(table);
        }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut sources = Self::default();
        for (table, column) in pairs {
            sources.add(column, table);
        }
        sources
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.map.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedQuery {
    pub select_sql: String,
    pub join_sql: String,
}

impl UnifiedQuery {
    pub fn full_sql(&self) -> String {
        format!("{}\n{}", self.select_sql, self.join_sql)
    }
}

/// Build the unified SELECT for one entity profile.
pub fn generate_unified_query(
    schema: &str,
    sources: &ColumnSources,
    profile: &EntityProfile,
) -> UnifiedQuery {
    let mut select_items = Vec::new();

    for (column, tables) in sources.columns() {
        if profile.is_excluded(column) {
            continue;
        }

        if profile.is_pinned(column) {
            select_items.push(qualified_column(schema, profile.anchor, column));
            continue;
        }

        // Stable sort: listed tables by rank, unlisted after in registration
        // order.
        let mut candidates: Vec<&str> = tables.iter().map(String::as_str).collect();
        candidates.sort_by_key(|t| profile.precedence_of(t));

        if !profile.anchor_in_coalesce {
            let filtered: Vec<&str> = candidates
                .iter()
                .copied()
                .filter(|t| *t != profile.anchor)
                .collect();
            if filtered.is_empty() {
                // Column lives only in the anchor; fall back to it directly.
                select_items.push(qualified_column(schema, profile.anchor, column));
                continue;
            }
            candidates = filtered;
        }

        if candidates.len() == 1 {
            select_items.push(qualified_column(schema, candidates[0], column));
        } else {
            let branches: Vec<String> = candidates
                .iter()
                .map(|table| {
                    let reference = qualified_column(schema, table, column);
                    if profile.casts_to_varchar(column) {
                        format!("CAST({reference} AS VARCHAR)")
                    } else {
                        reference
                    }
                })
                .collect();
            select_items.push(format!(
                "COALESCE({}) AS {}",
                branches.join(", "),
                quote_ident(column)
            ));
        }
    }

    let select_sql = format!("SELECT DISTINCT\n  {}", select_items.join(",\n  "));

    // Contributing tables join exactly once each, in name order.
    let contributing: BTreeSet<&str> = sources
        .columns()
        .flat_map(|(_, tables)| tables.iter().map(String::as_str))
        .filter(|t| *t != profile.anchor)
        .collect();

    let mut join_sql = format!("FROM {}", qualified_table(schema, profile.anchor));
    match profile.join {
        JoinStyle::Anchor { discriminator } => {
            for table in &contributing {
                join_sql.push_str(&format!(
                    "\nLEFT JOIN {} ON {} = {} AND {} = {}",
                    qualified_table(schema, table),
                    game_id_key(schema, profile.anchor),
                    game_id_key(schema, table),
                    qualified_column(schema, profile.anchor, discriminator),
                    qualified_column(schema, table, discriminator),
                ));
            }
        }
        JoinStyle::Chained { first, rest } => {
            let mut previous = profile.anchor;
            for table in &contributing {
                let discriminator = if previous == profile.anchor { first } else { rest };
                join_sql.push_str(&format!(
                    "\nLEFT JOIN {} ON {} = {} AND {} = {}",
                    qualified_table(schema, table),
                    game_id_key(schema, previous),
                    game_id_key(schema, table),
                    qualified_column(schema, previous, discriminator),
                    qualified_column(schema, table, discriminator),
                ));
                previous = table;
            }
        }
    }

    UnifiedQuery { select_sql, join_sql }
}
