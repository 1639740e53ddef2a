//! Per-kind normalizers.
//!
//! Each normalizer maps one raw entity (a JSON object from the
//! payload) into a typed record. Feeds disagree on field names, so
//! every field accepts the common aliases seen across providers.
//!
//! A normalizer only ever fails for the entity it was given; the
//! router keeps going with the rest of the batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::NormalizationError;
use crate::schema::{DataKind, Sport};
use crate::util::{GENERIC_LIST_FIELDS, field_as_f64, field_as_string, first_field};

/// One normalized entity, ready for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntity {
    /// Storage key, `{sport}:{provider id}`
    pub external_id: String,

    pub fields: Value,

    /// Prediction features, only for kinds that feed predictions
    pub features: Option<Value>,
}

/// Extracts the entity list of a payload.
///
/// Accepts a bare array, an object holding the kind's list field
/// (e.g. `{"players": [...]}`), or a single object which is
/// treated as one entity.
pub fn entity_list(kind: DataKind, payload: &Value) -> Result<Vec<Value>, NormalizationError> {
    match payload {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => {
            let fields = list_fields(kind);
            if let Some(items) = fields.iter().find_map(|f| map.get(*f).and_then(Value::as_array)) {
                return Ok(items.clone());
            }
            // Generic envelopes
            if let Some(items) = GENERIC_LIST_FIELDS
                .iter()
                .find_map(|f| map.get(*f).and_then(Value::as_array))
            {
                return Ok(items.clone());
            }
            Ok(vec![payload.clone()])
        }
        _ => Err(NormalizationError::MissingList(fields_label(kind))),
    }
}

fn list_fields(kind: DataKind) -> &'static [&'static str] {
    match kind {
        DataKind::PlayerStats => &["players", "athletes"],
        DataKind::Injuries => &["injuries"],
        DataKind::GameUpdates => &["games", "events"],
        DataKind::Odds => &["odds", "lines"],
        DataKind::Weather => &["weather", "forecasts"],
        DataKind::News => &["articles", "news"],
    }
}

fn fields_label(kind: DataKind) -> &'static str {
    list_fields(kind)[0]
}

/// Normalizes one raw entity of `kind`.
pub fn normalize(kind: DataKind, sport: Sport, raw: &Value) -> Result<NormalizedEntity, NormalizationError> {
    let obj = raw.as_object().ok_or(NormalizationError::NotAnObject)?;

    match kind {
        DataKind::PlayerStats => {
            let r = PlayerStatsRecord::from_json(sport, obj)?;
            let features = r.features();
            entity(sport, &r.player_id, &r, Some(features))
        }
        DataKind::Injuries => {
            let r = InjuryRecord::from_json(sport, obj)?;
            let features = r.features();
            entity(sport, &r.player_id, &r, Some(features))
        }
        DataKind::GameUpdates => {
            let r = GameUpdateRecord::from_json(sport, obj)?;
            entity(sport, &r.game_id, &r, None)
        }
        DataKind::Odds => {
            let r = OddsRecord::from_json(sport, obj)?;
            let key = format!("{}:{}", r.game_id, r.bookmaker);
            entity(sport, &key, &r, None)
        }
        DataKind::Weather => {
            let r = WeatherRecord::from_json(sport, obj)?;
            entity(sport, &r.location_id, &r, None)
        }
        DataKind::News => {
            let r = NewsRecord::from_json(sport, obj)?;
            entity(sport, &r.article_id, &r, None)
        }
    }
}

fn entity<T: Serialize>(
    sport: Sport,
    id: &str,
    record: &T,
    features: Option<Value>,
) -> Result<NormalizedEntity, NormalizationError> {
    let fields = serde_json::to_value(record).map_err(|e| NormalizationError::InvalidField {
        field: "record",
        reason: e.to_string(),
    })?;

    Ok(NormalizedEntity {
        external_id: format!("{sport}:{id}"),
        fields,
        features,
    })
}

fn required_string(
    obj: &Map<String, Value>,
    field: &'static str,
    aliases: &[&str],
) -> Result<String, NormalizationError> {
    field_as_string(obj, aliases).ok_or(NormalizationError::MissingField(field))
}

fn optional_string(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    field_as_string(obj, aliases)
}

fn parse_timestamp(obj: &Map<String, Value>, aliases: &[&str]) -> Option<DateTime<Utc>> {
    match first_field(obj, aliases)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

// ------------------------------------------------------------
// Player stats
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatsRecord {
    pub player_id: String,
    pub name: String,
    pub team: Option<String>,
    pub position: Option<String>,
    pub sport: Sport,

    /// Numeric stat lines; non-numeric values are dropped
    pub stats: BTreeMap<String, f64>,
}

impl PlayerStatsRecord {
    fn from_json(sport: Sport, obj: &Map<String, Value>) -> Result<Self, NormalizationError> {
        let player_id = required_string(obj, "player_id", &["player_id", "id", "playerId"])?;
        let name = required_string(obj, "name", &["name", "player_name", "fullName", "displayName"])?;

        let stats = match first_field(obj, &["stats", "statistics"]) {
            None => BTreeMap::new(),
            Some(Value::Object(raw)) => raw
                .iter()
                .filter_map(|(k, v)| stat_value(v).map(|n| (k.clone(), n)))
                .collect(),
            Some(_) => {
                return Err(NormalizationError::InvalidField {
                    field: "stats",
                    reason: "expected an object".to_string(),
                });
            }
        };

        Ok(Self {
            player_id,
            name,
            team: optional_string(obj, &["team", "team_abbr", "teamName"]),
            position: optional_string(obj, &["position", "pos"]),
            sport,
            stats,
        })
    }

    fn features(&self) -> Value {
        json!({
            "sport": self.sport,
            "position": self.position,
            "team": self.team,
            "stats": self.stats,
        })
    }
}

fn stat_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ------------------------------------------------------------
// Injuries
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjuryStatus {
    Out,
    InjuredReserve,
    Doubtful,
    Questionable,
    Probable,
    DayToDay,
    Active,
}

impl InjuryStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_lowercase().replace(['-', '_'], " ");
        let status = match s.as_str() {
            "out" | "o" | "suspended" => InjuryStatus::Out,
            "ir" | "injured reserve" | "il" | "injured list" | "60 day il" | "10 day il" => {
                InjuryStatus::InjuredReserve
            }
            "doubtful" | "d" => InjuryStatus::Doubtful,
            "questionable" | "q" | "game time decision" | "gtd" => InjuryStatus::Questionable,
            "probable" | "p" => InjuryStatus::Probable,
            "day to day" | "dtd" => InjuryStatus::DayToDay,
            "active" | "healthy" | "available" => InjuryStatus::Active,
            _ => return None,
        };
        Some(status)
    }

    /// Rough likelihood of missing the next game, used as a feature.
    pub fn severity(&self) -> f64 {
        match self {
            InjuryStatus::Out | InjuryStatus::InjuredReserve => 1.0,
            InjuryStatus::Doubtful => 0.75,
            InjuryStatus::Questionable => 0.5,
            InjuryStatus::DayToDay => 0.35,
            InjuryStatus::Probable => 0.25,
            InjuryStatus::Active => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InjuryRecord {
    pub player_id: String,
    pub player_name: Option<String>,
    pub team: Option<String>,
    pub sport: Sport,
    pub status: InjuryStatus,
    pub description: Option<String>,
    pub reported_at: Option<DateTime<Utc>>,
}

impl InjuryRecord {
    fn from_json(sport: Sport, obj: &Map<String, Value>) -> Result<Self, NormalizationError> {
        let player_id = required_string(obj, "player_id", &["player_id", "playerId", "id"])?;
        let raw_status = required_string(obj, "status", &["status", "injury_status", "designation"])?;
        let status = InjuryStatus::parse(&raw_status).ok_or_else(|| NormalizationError::InvalidField {
            field: "status",
            reason: format!("unknown injury status '{raw_status}'"),
        })?;

        Ok(Self {
            player_id,
            player_name: optional_string(obj, &["player_name", "name", "playerName"]),
            team: optional_string(obj, &["team", "team_abbr"]),
            sport,
            status,
            description: optional_string(obj, &["description", "injury", "details", "type"]),
            reported_at: parse_timestamp(obj, &["date", "reported_at", "updated"]),
        })
    }

    fn features(&self) -> Value {
        json!({
            "sport": self.sport,
            "status": self.status,
            "severity": self.status.severity(),
            "description": self.description,
        })
    }
}

// ------------------------------------------------------------
// Game updates
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
    Postponed,
}

impl GameStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw
            .trim()
            .to_lowercase()
            .trim_start_matches("status_")
            .replace(['-', '_'], " ");
        let status = match s.as_str() {
            "scheduled" | "pre" | "pregame" | "not started" => GameStatus::Scheduled,
            "in progress" | "live" | "in" | "halftime" | "end period" => GameStatus::InProgress,
            "final" | "post" | "finished" | "completed" | "full time" => GameStatus::Final,
            "postponed" | "canceled" | "cancelled" | "delayed" | "suspended" => GameStatus::Postponed,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GameUpdateRecord {
    pub game_id: String,
    pub sport: Sport,
    pub home_team: String,
    pub away_team: String,
    pub home_score: Option<f64>,
    pub away_score: Option<f64>,
    pub status: GameStatus,
    pub period: Option<String>,
    pub clock: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl GameUpdateRecord {
    fn from_json(sport: Sport, obj: &Map<String, Value>) -> Result<Self, NormalizationError> {
        let game_id = required_string(obj, "game_id", &["game_id", "id", "gameId", "event_id"])?;
        let home_team = required_string(obj, "home_team", &["home_team", "homeTeam", "home"])?;
        let away_team = required_string(obj, "away_team", &["away_team", "awayTeam", "away"])?;

        let status = match optional_string(obj, &["status", "state", "game_status"]) {
            None => GameStatus::Scheduled,
            Some(raw) => GameStatus::parse(&raw).ok_or_else(|| NormalizationError::InvalidField {
                field: "status",
                reason: format!("unknown game status '{raw}'"),
            })?,
        };

        Ok(Self {
            game_id,
            sport,
            home_team,
            away_team,
            home_score: field_as_f64(obj, &["home_score", "homeScore"]),
            away_score: field_as_f64(obj, &["away_score", "awayScore"]),
            status,
            period: optional_string(obj, &["period", "quarter", "inning"]),
            clock: optional_string(obj, &["clock", "time_remaining"]),
            start_time: parse_timestamp(obj, &["start_time", "date", "commence_time"]),
        })
    }
}

// ------------------------------------------------------------
// Odds
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OddsRecord {
    pub game_id: String,
    pub sport: Sport,
    pub bookmaker: String,
    pub home_moneyline: Option<f64>,
    pub away_moneyline: Option<f64>,
    pub home_implied_probability: Option<f64>,
    pub away_implied_probability: Option<f64>,
    pub spread: Option<f64>,
    pub total: Option<f64>,
}

impl OddsRecord {
    fn from_json(sport: Sport, obj: &Map<String, Value>) -> Result<Self, NormalizationError> {
        let game_id = required_string(obj, "game_id", &["game_id", "gameId", "event_id", "id"])?;
        let home = field_as_f64(obj, &["home_moneyline", "moneyline_home", "home_odds"]);
        let away = field_as_f64(obj, &["away_moneyline", "moneyline_away", "away_odds"]);
        let spread = field_as_f64(obj, &["spread", "point_spread", "handicap"]);
        let total = field_as_f64(obj, &["total", "over_under"]);

        if home.is_none() && away.is_none() && spread.is_none() && total.is_none() {
            return Err(NormalizationError::InvalidField {
                field: "odds",
                reason: "no moneyline, spread or total present".to_string(),
            });
        }

        Ok(Self {
            game_id,
            sport,
            bookmaker: optional_string(obj, &["bookmaker", "book", "sportsbook"])
                .unwrap_or_else(|| "consensus".to_string()),
            home_moneyline: home,
            away_moneyline: away,
            home_implied_probability: home.and_then(implied_probability),
            away_implied_probability: away.and_then(implied_probability),
            spread,
            total,
        })
    }
}

/// Implied win probability of American odds (+150, -200, ...).
pub fn implied_probability(american: f64) -> Option<f64> {
    if american >= 100.0 {
        Some(100.0 / (american + 100.0))
    } else if american <= -100.0 {
        Some(-american / (-american + 100.0))
    } else {
        None
    }
}

// ------------------------------------------------------------
// Weather
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WeatherRecord {
    /// Game id when the forecast is tied to a game, venue otherwise
    pub location_id: String,
    pub sport: Sport,
    pub venue: Option<String>,
    pub temperature_f: Option<f64>,
    pub wind_speed_mph: Option<f64>,
    pub precipitation_chance: Option<f64>,
    pub conditions: Option<String>,
}

impl WeatherRecord {
    fn from_json(sport: Sport, obj: &Map<String, Value>) -> Result<Self, NormalizationError> {
        let location_id = required_string(obj, "game_id", &["game_id", "gameId", "venue", "location"])?;
        let temperature = field_as_f64(obj, &["temperature", "temp", "temperature_f"]);

        if let Some(t) = temperature {
            if !(-80.0..=150.0).contains(&t) {
                return Err(NormalizationError::InvalidField {
                    field: "temperature",
                    reason: format!("{t} is out of range"),
                });
            }
        }

        Ok(Self {
            location_id,
            sport,
            venue: optional_string(obj, &["venue", "stadium"]),
            temperature_f: temperature,
            wind_speed_mph: field_as_f64(obj, &["wind_speed", "wind", "wind_mph"]),
            precipitation_chance: field_as_f64(obj, &["precipitation", "precip_chance", "pop"]),
            conditions: optional_string(obj, &["conditions", "summary", "description"]),
        })
    }
}

// ------------------------------------------------------------
// News
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NewsRecord {
    pub article_id: String,
    pub sport: Sport,
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub source: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl NewsRecord {
    fn from_json(sport: Sport, obj: &Map<String, Value>) -> Result<Self, NormalizationError> {
        let article_id = required_string(obj, "id", &["id", "article_id", "url", "link"])?;
        let title = required_string(obj, "title", &["title", "headline"])?;

        Ok(Self {
            article_id,
            sport,
            title,
            summary: optional_string(obj, &["summary", "description", "content"]),
            url: optional_string(obj, &["url", "link"]),
            source: optional_string(obj, &["source", "publisher"]),
            published_at: parse_timestamp(obj, &["published_at", "published", "date"]),
        })
    }
}
