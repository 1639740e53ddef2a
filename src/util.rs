/// Utility helpers shared by the scheduler, limiter and router.
///
/// This module contains:
/// - Origin key derivation for rate limiting
/// - Record count derivation for collected payloads
/// - Small JSON field accessors used by the normalizers
///
/// IMPORTANT:
/// - No kind-specific business logic should live here.
/// - This module must remain lightweight and deterministic.
///
use serde_json::{Map, Value};
use url::Url;

/// List fields recognised when counting entities in an object payload.
///
/// Holds every per-kind list field the normalizers accept, aliases
/// included, followed by `GENERIC_LIST_FIELDS`.
/// Order matters: the first list found wins.
pub const KNOWN_LIST_FIELDS: [&str; 14] = [
    "players",
    "athletes",
    "injuries",
    "games",
    "events",
    "odds",
    "lines",
    "weather",
    "forecasts",
    "articles",
    "news",
    "data",
    "items",
    "results",
];

/// Envelope fields that carry a list of any kind.
pub const GENERIC_LIST_FIELDS: [&str; 3] = ["data", "items", "results"];

/// Derive the rate-limit key for a source URL.
///
/// Format:
///     scheme://host[:port]
///
/// Examples:
/// - "https://site.api.espn.com/apis/site/v2/sports" -> "https://site.api.espn.com"
/// - "http://localhost:8080/odds"                     -> "http://localhost:8080"
///
/// Sources on the same origin share one rate-limit window.
/// Unparseable input is used verbatim so it still gets its own window.
///
pub fn origin_key(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => match url.host_str() {
            Some(host) => match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            },
            None => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

/// Count the entities contained in a raw payload.
///
/// - Array              -> its length
/// - Object with a list -> length of the first `KNOWN_LIST_FIELDS` entry
/// - Anything else      -> 1
///
pub fn derive_record_count(payload: &Value) -> usize {
    match payload {
        Value::Array(items) => items.len(),
        Value::Object(map) => KNOWN_LIST_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_array))
            .map_or(1, Vec::len),
        _ => 1,
    }
}

/// Return the first present, non-null field among `names`.
pub fn first_field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| obj.get(*name).filter(|v| !v.is_null()))
}

/// Read a field as a string, accepting numbers as well
/// (many feeds send ids as integers).
pub fn field_as_string(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match first_field(obj, names)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a field as f64, accepting numeric strings ("+150", "72.5").
pub fn field_as_f64(obj: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    match first_field(obj, names)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('+').parse().ok(),
        _ => None,
    }
}
