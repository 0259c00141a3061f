//! Core domain model for boxsync: seasons, stat categories, table families,
//! and the canonical game identifier every join and comparison keys on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed width of a normalized game identifier.
pub const GAME_ID_WIDTH: usize = 10;

/// Canonical, zero-padded game identifier.
///
/// The provider emits game ids as strings with leading zeros, CSV sniffers and
/// the database read them back as integers, and older files mix both forms.
/// Every comparison and join in the system goes through [`GameId::normalize`]
/// so the two representations always collapse to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(String);

impl GameId {
    /// Normalize a raw identifier to the fixed-width zero-padded form.
    ///
    /// Idempotent: normalizing an already-normalized id is a no-op.
    pub fn normalize(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        Self(format!("{trimmed:0>width$}", width = GAME_ID_WIDTH))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading three digits encode the game type (002 regular season,
    /// 004 postseason, 006 cup).
    pub fn type_prefix(&self) -> &str {
        &self.0[..3.min(self.0.len())]
    }
}

impl From<i64> for GameId {
    fn from(value: i64) -> Self {
        Self::normalize(value.to_string())
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One reporting period, labelled the provider's way: `"2024-25"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Season(String);

impl Season {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    /// Calendar year the season starts in (`"2024-25"` → 2024). Falls back to
    /// 0 for malformed labels rather than failing; callers only use this for
    /// building season-id filters.
    pub fn start_year(&self) -> i32 {
        self.0
            .split('-')
            .next()
            .and_then(|y| y.parse().ok())
            .unwrap_or(0)
    }

    /// Provider season ids partition games by type: regular season rows carry
    /// `2{year}`, postseason `4{year}`, cup `6{year}`.
    pub fn season_id(&self, game_type: GameType) -> String {
        format!("{}{}", game_type.season_id_digit(), self.start_year())
    }

    /// Inclusive range of seasons, `start_year..=end_year` start years.
    pub fn range(start_year: i32, end_year: i32) -> Vec<Season> {
        (start_year..=end_year)
            .map(|y| Season::new(format!("{y}-{:02}", (y + 1) % 100)))
            .collect()
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Game types the collector keeps; other rows in the provider index (preseason,
/// exhibition) are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameType {
    RegularSeason,
    Postseason,
    Cup,
}

impl GameType {
    pub const ALL: [GameType; 3] = [GameType::RegularSeason, GameType::Postseason, GameType::Cup];

    fn season_id_digit(self) -> char {
        match self {
            GameType::RegularSeason => '2',
            GameType::Postseason => '4',
            GameType::Cup => '6',
        }
    }

    /// Matching `GAME_ID` prefix for this game type.
    pub fn game_id_prefix(self) -> &'static str {
        match self {
            GameType::RegularSeason => "002",
            GameType::Postseason => "004",
            GameType::Cup => "006",
        }
    }
}

/// Statistical endpoint/table kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatCategory {
    Advanced,
    FourFactors,
    Misc,
    Scoring,
    Traditional,
}

impl StatCategory {
    pub const ALL: [StatCategory; 5] = [
        StatCategory::Advanced,
        StatCategory::FourFactors,
        StatCategory::Misc,
        StatCategory::Scoring,
        StatCategory::Traditional,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatCategory::Advanced => "advanced",
            StatCategory::FourFactors => "fourfactors",
            StatCategory::Misc => "misc",
            StatCategory::Scoring => "scoring",
            StatCategory::Traditional => "traditional",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == value)
            .ok_or_else(|| DomainError::UnknownCategory(value.to_string()))
    }
}

impl fmt::Display for StatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a row describes a team or a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Teams,
    Players,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Teams, EntityKind::Players];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Teams => "teams",
            EntityKind::Players => "players",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical destination table and its static primary-key tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFamily {
    Stats(EntityKind, StatCategory),
    Log,
    Lines,
}

impl TableFamily {
    /// Destination table name inside the raw schema.
    pub fn table_name(self) -> String {
        match self {
            TableFamily::Stats(kind, category) => format!("{}_{}", kind.as_str(), category.as_str()),
            TableFamily::Log => "log_table".to_string(),
            TableFamily::Lines => "lines_table".to_string(),
        }
    }

    /// The composite key identifying one row of this table.
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            TableFamily::Stats(EntityKind::Teams, _) | TableFamily::Log => &["GAME_ID", "TEAM_ID"],
            TableFamily::Stats(EntityKind::Players, _) => &["GAME_ID", "PLAYER_ID"],
            TableFamily::Lines => &["GAME_ID", "TEAM_ABBREVIATION"],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("unknown stat category '{0}'")]
    UnknownCategory(String),
}
