//! JSON shapes exchanged with the capture device and the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use enrollsync_core::record::de_lenient_string;
use enrollsync_core::{EventRecord, Pagination};

use crate::error::ChannelError;

/// Push message types.
pub const ENROLLMENT_STARTED: &str = "enrollment_started";
pub const ENROLLMENT_PROGRESS: &str = "enrollment_progress";
pub const ENROLLMENT_COMPLETE: &str = "enrollment_complete";
pub const ENROLLMENT_STOPPED: &str = "enrollment_stopped";

/// Event-log `event_type` values.
pub const LOG_ENROLLMENT: &str = "enrollment";
pub const LOG_ENROLLMENT_PROGRESS: &str = "enrollment_progress";
pub const LOG_ENROLLMENT_FAILED: &str = "enrollment_failed";
pub const LOG_ENROLLMENT_CANCELLED: &str = "enrollment_cancelled";

/// A message delivered on the push connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "de_lenient_string")]
    pub member_id: String,
    #[serde(default)]
    pub member_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Standard `{success, data, ...}` response wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// Fail with the server's own message when `success` is false.
    pub fn into_result(self) -> Result<Self, ChannelError> {
        if self.success {
            Ok(self)
        } else {
            let reason = self
                .error
                .or(self.message)
                .unwrap_or_else(|| "request unsuccessful".to_string());
            Err(ChannelError::Api(reason))
        }
    }
}

/// `data` of the member-filtered event-log poll.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventLogData {
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Body of the device start request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest<'a> {
    pub member_id: &'a str,
    pub member_name: &'a str,
}

/// Body of the device cancel request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest<'a> {
    pub member_id: &'a str,
}

/// Decode rows one by one so a malformed row never hides the good ones.
///
/// Returns `(records, errors)` where errors carry the row's position.
pub fn parse_rows(rows: Vec<Value>) -> (Vec<EventRecord>, Vec<(usize, ChannelError)>) {
    let mut records = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();

    for (idx, row) in rows.into_iter().enumerate() {
        match serde_json::from_value::<EventRecord>(row) {
            Ok(rec) => records.push(rec),
            Err(e) => {
                warn!(row = idx, error = %e, "skipping malformed event-log row");
                errors.push((idx, ChannelError::Decode(e)));
            }
        }
    }

    (records, errors)
}

/// Decode one push frame.
///
/// Accepts bare JSON lines and SSE framing. Returns `None` for keep-alives,
/// comments, `event:`/`id:` lines and blank lines.
pub fn decode_push_frame(line: &str) -> Option<Result<PushMessage, ChannelError>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None if line.starts_with('{') => line,
        None => return None,
    };
    if payload.is_empty() {
        return None;
    }
    Some(serde_json::from_str(payload).map_err(ChannelError::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_message_with_numeric_member_id() {
        let msg: PushMessage = serde_json::from_value(json!({
            "type": "enrollment_progress",
            "memberId": 42,
            "memberName": "Jane",
            "currentStep": "Place finger again"
        }))
        .unwrap();
        assert_eq!(msg.kind, ENROLLMENT_PROGRESS);
        assert_eq!(msg.member_id, "42");
        assert_eq!(msg.current_step.as_deref(), Some("Place finger again"));
        assert!(msg.timestamp.is_none());
    }

    #[test]
    fn envelope_failure_surfaces_server_message() {
        let env: ApiEnvelope<EventLogData> =
            serde_json::from_value(json!({"success": false, "message": "device offline"})).unwrap();
        match env.into_result() {
            Err(ChannelError::Api(msg)) => assert_eq!(msg, "device offline"),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn parse_rows_keeps_good_rows() {
        let rows = vec![
            json!({"id": 1, "event_type": "enrollment", "success": true, "timestamp": "2024-05-01T10:00:00Z"}),
            json!({"id": "not-a-number", "event_type": "enrollment"}),
            json!({"id": 3, "event_type": "enrollment_progress", "timestamp": "2024-05-01T10:00:02Z"}),
        ];
        let (records, errors) = parse_rows(rows);
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 1);
    }

    #[test]
    fn decode_sse_and_bare_frames() {
        let sse = r#"data: {"type":"enrollment_started","memberId":"7","memberName":"Bo"}"#;
        let msg = decode_push_frame(sse).unwrap().unwrap();
        assert_eq!(msg.kind, ENROLLMENT_STARTED);
        assert_eq!(msg.member_name.as_deref(), Some("Bo"));

        let bare = r#"{"type":"enrollment_stopped","memberId":"7","reason":"user"}"#;
        assert!(decode_push_frame(bare).unwrap().is_ok());

        assert!(decode_push_frame("").is_none());
        assert!(decode_push_frame(": keep-alive").is_none());
        assert!(decode_push_frame("event: enrollment").is_none());
        assert!(decode_push_frame("data: {broken").unwrap().is_err());
    }
}
