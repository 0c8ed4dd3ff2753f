//! Event-log records and paginated query results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One row of the shared event log.
///
/// Used both by the poll loop (filtered by member) and by the events browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(deserialize_with = "de_lenient_i64")]
    pub id: i64,
    pub event_type: String,
    #[serde(default)]
    pub success: Option<bool>,
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        alias = "memberId",
        deserialize_with = "de_opt_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub member_id: Option<String>,
    /// Device payload. Some producers send it JSON-encoded as a string.
    #[serde(default)]
    pub raw_data: Value,
}

impl EventRecord {
    /// `raw_data` as an object, decoding the string-encoded form if needed.
    pub fn raw_object(&self) -> Option<serde_json::Map<String, Value>> {
        match &self.raw_data {
            Value::Object(map) => Some(map.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }

    /// First non-empty string found under any of `keys` in `raw_data`.
    pub fn raw_str(&self, keys: &[&str]) -> Option<String> {
        let obj = self.raw_object()?;
        keys.iter().find_map(|k| {
            obj.get(*k)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }
}

/// Pagination block returned by the events query endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

/// Parameters of one events-browser query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventQuery {
    pub page: u32,
    pub page_size: u32,
    pub search: Option<String>,
}

impl EventQuery {
    /// Blank search terms are treated as no search.
    pub fn new(page: u32, page_size: u32, search: Option<&str>) -> Self {
        Self {
            page,
            page_size,
            search: search
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

/// One page of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub rows: Vec<EventRecord>,
    pub pagination: Pagination,
}

/// Accept ids sent as JSON numbers or numeric strings.
pub fn de_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match &v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| serde::de::Error::custom(format!("expected integer id, got {v}")))
}

/// Accept member ids sent as JSON numbers or strings.
pub fn de_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    value_to_id_string(&v)
        .ok_or_else(|| serde::de::Error::custom(format!("expected string or number, got {v}")))
}

pub fn de_opt_lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(value_to_id_string))
}

fn value_to_id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
