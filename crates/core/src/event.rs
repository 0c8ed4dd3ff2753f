//! Channel-agnostic enrollment facts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which notification source produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceChannel {
    Push,
    Poll,
}

impl fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// What happened to an enrollment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EventKind {
    Started { actor_name: Option<String> },
    ProgressUpdate(String),
    Succeeded,
    Failed(String),
    Cancelled(String),
}

impl EventKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::ProgressUpdate(_) => "progress",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// A single fact inferred from either the push or the poll channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub source_channel: SourceChannel,
    /// Durable event-log id. Push messages usually have none.
    pub event_id: Option<i64>,
    pub actor_id: String,
    pub kind: EventKind,
    pub observed_at: DateTime<Utc>,
}

impl NormalizedEvent {
    pub fn new(
        source_channel: SourceChannel,
        actor_id: impl Into<String>,
        kind: EventKind,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_channel,
            event_id: None,
            actor_id: actor_id.into(),
            kind,
            observed_at,
        }
    }

    pub fn with_event_id(mut self, event_id: i64) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_event_id() {
        let ev = NormalizedEvent::new(SourceChannel::Poll, "42", EventKind::Succeeded, Utc::now())
            .with_event_id(7);
        assert_eq!(ev.event_id, Some(7));
        assert_eq!(ev.actor_id, "42");
        assert_eq!(ev.kind.label(), "succeeded");
    }

    #[test]
    fn kind_serializes_tagged() {
        let json = serde_json::to_value(EventKind::Failed("finger moved".into())).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["detail"], "finger moved");
    }
}
