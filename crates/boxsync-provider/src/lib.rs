//! Stats-provider HTTP client: per-season game index and per-game box score
//! endpoints, with bounded retry and a transient/permanent error taxonomy.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use boxsync_core::{GameId, GameType, Season, StatCategory};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

/// A decoded tabular result set: raw provider field names, stringified cells.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TabularRows {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TabularRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Values of one column, in row order. Empty iterator when the column is
    /// absent.
    pub fn column_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let idx = self.column_index(name);
        self.rows
            .iter()
            .filter_map(move |row| idx.and_then(|i| row.get(i)).map(String::as_str))
    }

    /// Keep only rows the predicate accepts.
    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[String]) -> bool) {
        self.rows.retain(|row| keep(row));
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeouts and transport hiccups, already retried up to the cap.
    #[error("transient provider failure after {attempts} attempt(s): {message}")]
    Transient { attempts: usize, message: String },
    /// Malformed responses, rejected requests: retrying cannot help.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://stats.nba.com/stats".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "boxsync/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Season index from the authoritative game-finder endpoint.
#[derive(Debug, Clone, Default)]
pub struct GameIndex {
    /// Full log rows for the season, provider field names preserved.
    pub log: TabularRows,
    /// Normalized ids of every game in the index.
    pub game_ids: BTreeSet<GameId>,
}

/// One fetched box score: the player-grain and team-grain result sets.
#[derive(Debug, Clone, Default)]
pub struct BoxScore {
    pub players: TabularRows,
    pub teams: TabularRows,
}

impl BoxScore {
    /// Games scheduled but not yet played come back with empty result sets.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() || self.teams.is_empty()
    }
}

/// Seam between the reconciler and the provider, mockable in tests.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch_season_index(&self, season: &Season) -> Result<GameIndex, ProviderError>;

    async fn fetch_box_score(
        &self,
        category: StatCategory,
        game_id: &GameId,
    ) -> Result<BoxScore, ProviderError>;
}

// -- wire format ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(rename = "resultSets", default)]
    result_sets: Vec<ResultSet>,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    #[serde(default)]
    name: String,
    #[serde(default)]
    headers: Vec<String>,
    #[serde(rename = "rowSet", default)]
    row_set: Vec<Vec<JsonValue>>,
}

fn cell_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn tabular_from_result_set(set: &ResultSet) -> TabularRows {
    TabularRows {
        headers: set.headers.clone(),
        rows: set
            .row_set
            .iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect(),
    }
}

/// Decode a raw stats payload, selecting a result set by name with a
/// positional fallback (older payloads omit set names).
pub fn decode_result_set(body: &[u8], name: &str, fallback_index: usize) -> Result<TabularRows, ProviderError> {
    let response: StatsResponse = serde_json::from_slice(body)
        .map_err(|err| ProviderError::Permanent(format!("malformed stats payload: {err}")))?;
    let set = response
        .result_sets
        .iter()
        .find(|s| s.name == name)
        .or_else(|| response.result_sets.get(fallback_index))
        .ok_or_else(|| ProviderError::Permanent(format!("result set '{name}' absent from payload")))?;
    Ok(tabular_from_result_set(set))
}

/// Drop index rows outside the season's regular/post/cup partitions; other
/// game types (preseason, exhibitions) share the endpoint but are not
/// collected.
pub fn filter_index_to_season(log: &mut TabularRows, season: &Season) {
    let Some(season_idx) = log.column_index("SEASON_ID") else {
        return;
    };
    let Some(game_idx) = log.column_index("GAME_ID") else {
        return;
    };
    log.retain_rows(|row| {
        GameType::ALL.iter().any(|gt| {
            row.get(season_idx).map(String::as_str) == Some(season.season_id(*gt).as_str())
                && row
                    .get(game_idx)
                    .map(|gid| GameId::normalize(gid).type_prefix() == gt.game_id_prefix())
                    .unwrap_or(false)
        })
    });
}

fn endpoint_for(category: StatCategory) -> &'static str {
    match category {
        StatCategory::Advanced => "boxscoreadvancedv2",
        StatCategory::FourFactors => "boxscorefourfactorsv2",
        StatCategory::Misc => "boxscoremiscv2",
        StatCategory::Scoring => "boxscorescoringv2",
        StatCategory::Traditional => "boxscoretraditionalv2",
    }
}

/// HTTP client against the real stats provider.
#[derive(Debug)]
pub struct NbaStatsClient {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl NbaStatsClient {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url,
            backoff: config.backoff,
        })
    }

    /// GET with bounded retry. Transient failures back off exponentially up to
    /// the attempt cap; everything else fails fast as permanent.
    async fn get_with_retry(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let mut last_message = String::new();

        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .http
                .get(&url)
                .header("Referer", "https://www.nba.com/")
                .query(query)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.bytes().await.map(|b| b.to_vec()).map_err(|err| {
                            ProviderError::Permanent(format!("reading body for {path}: {err}"))
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(ProviderError::Permanent(format!(
                            "http status {status} for {path}"
                        )));
                    }
                    last_message = format!("http status {status} for {path}");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(ProviderError::Permanent(format!(
                            "request for {path} failed: {err}"
                        )));
                    }
                    last_message = format!("{err}");
                }
            }

            if attempt < self.backoff.max_retries {
                warn!(message = %last_message, path, attempt, "retrying provider request");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        Err(ProviderError::Transient {
            attempts: self.backoff.max_retries + 1,
            message: last_message,
        })
    }
}

#[async_trait]
impl StatsSource for NbaStatsClient {
    async fn fetch_season_index(&self, season: &Season) -> Result<GameIndex, ProviderError> {
        let body = self
            .get_with_retry(
                "leaguegamefinder",
                &[
                    ("SeasonNullable", season.label()),
                    ("LeagueID", "00"),
                    ("PlayerOrTeam", "T"),
                ],
            )
            .await?;

        let mut log = decode_result_set(&body, "LeagueGameFinderResults", 0)?;
        filter_index_to_season(&mut log, season);

        let game_ids = log.column_values("GAME_ID").map(GameId::normalize).collect();
        Ok(GameIndex { log, game_ids })
    }

    async fn fetch_box_score(
        &self,
        category: StatCategory,
        game_id: &GameId,
    ) -> Result<BoxScore, ProviderError> {
        let body = self
            .get_with_retry(
                endpoint_for(category),
                &[
                    ("GameID", game_id.as_str()),
                    ("StartPeriod", "0"),
                    ("EndPeriod", "10"),
                    ("StartRange", "0"),
                    ("EndRange", "0"),
                    ("RangeType", "0"),
                ],
            )
            .await?;

        Ok(BoxScore {
            players: decode_result_set(&body, "PlayerStats", 0)?,
            teams: decode_result_set(&body, "TeamStats", 1)?,
        })
    }
}
