use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ------------------------------------------------------------
// Data kind
// ------------------------------------------------------------
//
// Category of payload a source produces. The router dispatches
// on this value, so adding a variant requires:
// - a normalizer in router::normalize
// - a match arm in Router::handle_entity
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    PlayerStats,
    Injuries,
    GameUpdates,
    Odds,
    Weather,
    News,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::PlayerStats,
        DataKind::Injuries,
        DataKind::GameUpdates,
        DataKind::Odds,
        DataKind::Weather,
        DataKind::News,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::PlayerStats => "player_stats",
            DataKind::Injuries => "injuries",
            DataKind::GameUpdates => "game_updates",
            DataKind::Odds => "odds",
            DataKind::Weather => "weather",
            DataKind::News => "news",
        }
    }

    /// Whether normalized entities of this kind are sent to the
    /// prediction service.
    pub fn feeds_predictions(&self) -> bool {
        matches!(self, DataKind::PlayerStats | DataKind::Injuries)
    }

    /// Name of the downstream update emitted once a record of this
    /// kind has been processed.
    pub fn update_name(&self) -> &'static str {
        match self {
            DataKind::PlayerStats => "player_updated",
            DataKind::Injuries => "injury_updated",
            DataKind::GameUpdates => "game_updated",
            DataKind::Odds => "odds_updated",
            DataKind::Weather => "weather_updated",
            DataKind::News => "news_updated",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------
// Sport
// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Nfl,
    Nba,
    Mlb,
    Nhl,
    Soccer,
    Ncaaf,
    Ncaab,
    #[serde(other)]
    Other,
}

impl Sport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Nfl => "nfl",
            Sport::Nba => "nba",
            Sport::Mlb => "mlb",
            Sport::Nhl => "nhl",
            Sport::Soccer => "soccer",
            Sport::Ncaaf => "ncaaf",
            Sport::Ncaab => "ncaab",
            Sport::Other => "other",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------
// Fetch mechanism
// ------------------------------------------------------------
//
// Selects the fetch adapter used for a source.
//
// - Http:    plain HTTP GET returning JSON
// - Browser: headless-browser render through the render service
// - Crawl:   crawl-and-extract through the render service
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMechanism {
    Http,
    Browser,
    Crawl,
}

impl FetchMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMechanism::Http => "http",
            FetchMechanism::Browser => "browser",
            FetchMechanism::Crawl => "crawl",
        }
    }
}

impl fmt::Display for FetchMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------
// Collected record
// ------------------------------------------------------------
//
// Produced by the scheduler for every successful fetch and
// consumed exactly once by the router.
//
// A record is terminal once `processed` is set. A re-fetch of the
// same source always produces a new record with a new id.
//
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedRecord {
    pub id: Uuid,

    pub source_id: String,

    pub kind: DataKind,

    pub sport: Sport,

    pub collected_at: DateTime<Utc>,

    /// Raw adapter output. Opaque to the scheduler, interpreted
    /// by the kind-specific normalizer.
    pub payload: Value,

    /// Number of entities in the payload (see `util::derive_record_count`)
    pub record_count: usize,

    /// Wall time spent inside the fetch adapter
    #[serde(with = "duration_ms")]
    pub latency: Duration,

    pub processed: bool,
}

impl CollectedRecord {
    pub fn new(
        source_id: impl Into<String>,
        kind: DataKind,
        sport: Sport,
        payload: Value,
        latency: Duration,
    ) -> Self {
        let record_count = crate::util::derive_record_count(&payload);

        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            kind,
            sport,
            collected_at: Utc::now(),
            payload,
            record_count,
            latency,
            processed: false,
        }
    }
}

// ------------------------------------------------------------
// Collection error
// ------------------------------------------------------------
//
// Ephemeral failure record. Lives only in the monitor's bounded
// error buffer; never persisted.
//
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionError {
    pub source_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CollectionError {
    pub fn new(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
