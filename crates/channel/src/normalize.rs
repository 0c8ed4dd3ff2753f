//! Turn raw push messages and event-log rows into [`NormalizedEvent`]s.
//!
//! Unknown message types and log rows for unrelated event types map to
//! `None`; they are logged at debug level and skipped.

use chrono::{DateTime, Utc};
use tracing::debug;

use enrollsync_core::{EventKind, EventRecord, NormalizedEvent, SourceChannel};

use crate::wire::{
    PushMessage, ENROLLMENT_COMPLETE, ENROLLMENT_PROGRESS, ENROLLMENT_STARTED, ENROLLMENT_STOPPED,
    LOG_ENROLLMENT, LOG_ENROLLMENT_CANCELLED, LOG_ENROLLMENT_FAILED, LOG_ENROLLMENT_PROGRESS,
};

const ERROR_STATUSES: &[&str] = &["error", "failed", "failure"];
const SUCCESS_STATUSES: &[&str] = &["success", "succeeded", "completed", "complete", "ok"];

const DEFAULT_FAILURE: &str = "enrollment failed";

fn first_text(candidates: &[Option<&String>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn status_in(status: Option<&str>, set: &[&str]) -> bool {
    status
        .map(|s| set.iter().any(|k| s.eq_ignore_ascii_case(k)))
        .unwrap_or(false)
}

/// Map a push message onto a normalized event.
///
/// `received_at` is used when the message carries no timestamp of its own.
pub fn normalize_push(msg: &PushMessage, received_at: DateTime<Utc>) -> Option<NormalizedEvent> {
    let status = msg.status.as_deref();
    let failure_text = || {
        first_text(&[msg.message.as_ref(), msg.reason.as_ref()])
            .unwrap_or_else(|| DEFAULT_FAILURE.to_string())
    };

    let kind = match msg.kind.as_str() {
        ENROLLMENT_STARTED => EventKind::Started {
            actor_name: first_text(&[msg.member_name.as_ref()]),
        },
        ENROLLMENT_PROGRESS if status_in(status, ERROR_STATUSES) => {
            EventKind::Failed(failure_text())
        }
        ENROLLMENT_PROGRESS => EventKind::ProgressUpdate(
            first_text(&[msg.current_step.as_ref(), msg.message.as_ref()])
                .unwrap_or_else(|| "progress".to_string()),
        ),
        ENROLLMENT_COMPLETE if status.is_none() || status_in(status, SUCCESS_STATUSES) => {
            EventKind::Succeeded
        }
        ENROLLMENT_COMPLETE => EventKind::Failed(failure_text()),
        ENROLLMENT_STOPPED => EventKind::Cancelled(
            first_text(&[msg.reason.as_ref(), msg.message.as_ref()])
                .unwrap_or_else(|| "stopped".to_string()),
        ),
        other => {
            debug!(kind = other, member_id = %msg.member_id, "ignoring unknown push message type");
            return None;
        }
    };

    Some(NormalizedEvent::new(
        SourceChannel::Push,
        msg.member_id.clone(),
        kind,
        msg.timestamp.unwrap_or(received_at),
    ))
}

/// Map an event-log row for `actor_id` onto a normalized event.
///
/// The poll request is already filtered by member, so rows without a
/// `member_id` are attributed to `actor_id`; rows naming another member
/// keep their own id and are dropped later by the state machine.
pub fn normalize_log_row(row: &EventRecord, actor_id: &str) -> Option<NormalizedEvent> {
    let kind = match row.event_type.as_str() {
        LOG_ENROLLMENT if row.success == Some(true) => EventKind::Succeeded,
        LOG_ENROLLMENT => EventKind::Failed(
            row.raw_str(&["message", "reason", "error"])
                .unwrap_or_else(|| DEFAULT_FAILURE.to_string()),
        ),
        LOG_ENROLLMENT_PROGRESS => EventKind::ProgressUpdate(
            row.raw_str(&["currentStep", "current_step", "step", "message"])
                .unwrap_or_else(|| "progress".to_string()),
        ),
        LOG_ENROLLMENT_FAILED => EventKind::Failed(
            row.raw_str(&["reason", "message", "error"])
                .unwrap_or_else(|| DEFAULT_FAILURE.to_string()),
        ),
        LOG_ENROLLMENT_CANCELLED => EventKind::Cancelled(
            row.raw_str(&["reason", "message"])
                .unwrap_or_else(|| "cancelled".to_string()),
        ),
        other => {
            debug!(event_type = other, event_id = row.id, "ignoring unrelated log row");
            return None;
        }
    };

    let actor = row.member_id.clone().unwrap_or_else(|| actor_id.to_string());
    Some(NormalizedEvent::new(SourceChannel::Poll, actor, kind, row.timestamp).with_event_id(row.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(value: serde_json::Value) -> PushMessage {
        serde_json::from_value(value).unwrap()
    }

    fn row(value: serde_json::Value) -> EventRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn push_started_carries_member_name() {
        let now = Utc::now();
        let ev = normalize_push(
            &push(json!({"type": "enrollment_started", "memberId": 42, "memberName": "Jane"})),
            now,
        )
        .unwrap();
        assert_eq!(ev.source_channel, SourceChannel::Push);
        assert_eq!(ev.actor_id, "42");
        assert_eq!(ev.event_id, None);
        assert_eq!(ev.observed_at, now);
        assert_eq!(ev.kind, EventKind::Started { actor_name: Some("Jane".into()) });
    }

    #[test]
    fn push_progress_with_error_status_is_failure() {
        let ev = normalize_push(
            &push(json!({
                "type": "enrollment_progress", "memberId": "42",
                "status": "ERROR", "message": "sensor timeout"
            })),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(ev.kind, EventKind::Failed("sensor timeout".into()));
    }

    #[test]
    fn push_complete_maps_status() {
        let ok = normalize_push(
            &push(json!({"type": "enrollment_complete", "memberId": "42", "status": "success"})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(ok.kind, EventKind::Succeeded);

        let bare = normalize_push(
            &push(json!({"type": "enrollment_complete", "memberId": "42"})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(bare.kind, EventKind::Succeeded);

        let failed = normalize_push(
            &push(json!({"type": "enrollment_complete", "memberId": "42", "status": "failed"})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(failed.kind, EventKind::Failed(DEFAULT_FAILURE.into()));
    }

    #[test]
    fn push_stopped_and_unknown() {
        let stopped = normalize_push(
            &push(json!({"type": "enrollment_stopped", "memberId": "42", "reason": "operator"})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(stopped.kind, EventKind::Cancelled("operator".into()));

        assert!(normalize_push(
            &push(json!({"type": "door_opened", "memberId": "42"})),
            Utc::now()
        )
        .is_none());
    }

    #[test]
    fn push_timestamp_wins_over_receive_time() {
        let sent: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let ev = normalize_push(
            &push(json!({
                "type": "enrollment_progress", "memberId": "42",
                "currentStep": "scan 1/3", "timestamp": "2024-05-01T10:00:00Z"
            })),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(ev.observed_at, sent);
        assert_eq!(ev.kind, EventKind::ProgressUpdate("scan 1/3".into()));
    }

    #[test]
    fn log_rows_map_by_event_type() {
        let success = normalize_log_row(
            &row(json!({"id": 7, "event_type": "enrollment", "success": true,
                        "timestamp": "2024-05-01T10:00:05Z"})),
            "42",
        )
        .unwrap();
        assert_eq!(success.kind, EventKind::Succeeded);
        assert_eq!(success.event_id, Some(7));
        assert_eq!(success.actor_id, "42");
        assert_eq!(success.source_channel, SourceChannel::Poll);

        let failed = normalize_log_row(
            &row(json!({"id": 8, "event_type": "enrollment", "success": false,
                        "timestamp": "2024-05-01T10:00:05Z",
                        "raw_data": "{\"message\":\"poor quality\"}"})),
            "42",
        )
        .unwrap();
        assert_eq!(failed.kind, EventKind::Failed("poor quality".into()));

        let progress = normalize_log_row(
            &row(json!({"id": 9, "event_type": "enrollment_progress",
                        "timestamp": "2024-05-01T10:00:05Z",
                        "raw_data": {"currentStep": "lift finger"}})),
            "42",
        )
        .unwrap();
        assert_eq!(progress.kind, EventKind::ProgressUpdate("lift finger".into()));

        let cancelled = normalize_log_row(
            &row(json!({"id": 10, "event_type": "enrollment_cancelled",
                        "timestamp": "2024-05-01T10:00:05Z"})),
            "42",
        )
        .unwrap();
        assert_eq!(cancelled.kind, EventKind::Cancelled("cancelled".into()));

        assert!(normalize_log_row(
            &row(json!({"id": 11, "event_type": "checkin", "timestamp": "2024-05-01T10:00:05Z"})),
            "42",
        )
        .is_none());
    }

    #[test]
    fn log_row_keeps_its_own_member() {
        let ev = normalize_log_row(
            &row(json!({"id": 12, "event_type": "enrollment_failed", "memberId": 99,
                        "timestamp": "2024-05-01T10:00:05Z", "raw_data": {"reason": "dup"}})),
            "42",
        )
        .unwrap();
        assert_eq!(ev.actor_id, "99");
        assert_eq!(ev.kind, EventKind::Failed("dup".into()));
    }
}
