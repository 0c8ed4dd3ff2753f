//! Enrollment session state shared between the engine and its consumers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Started,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionStatus {
    /// `Started` or `InProgress`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// One tracked enrollment attempt for one member.
///
/// Never holds `Idle`: the idle state is the absence of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSession {
    pub attempt_id: Uuid,
    pub actor_id: String,
    pub actor_name: String,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub last_seen_event_id: Option<i64>,
    pub failure_reason: Option<String>,
    pub current_step: Option<String>,
}

impl EnrollmentSession {
    pub fn start(
        actor_id: impl Into<String>,
        actor_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            actor_id: actor_id.into(),
            actor_name: actor_name.into(),
            started_at: now,
            last_progress_at: None,
            status: SessionStatus::Started,
            last_seen_event_id: None,
            failure_reason: None,
            current_step: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reference point of the timeout clock.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_progress_at.unwrap_or(self.started_at)
    }
}

/// Read-only view of the engine's current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session: Option<EnrollmentSession>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            session: None,
        }
    }

    pub fn of(session: Option<&EnrollmentSession>) -> Self {
        match session {
            Some(s) => Self {
                status: s.status,
                session: Some(s.clone()),
            },
            None => Self::idle(),
        }
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.actor_id.as_str())
    }

    pub fn last_seen_event_id(&self) -> Option<i64> {
        self.session.as_ref().and_then(|s| s.last_seen_event_id)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.failure_reason.as_deref())
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
