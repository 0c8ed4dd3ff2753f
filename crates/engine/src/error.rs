//! Engine error taxonomy.

use enrollsync_channel::ChannelError;
use enrollsync_core::{EnrollmentSession, SessionStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A session already exists (running, or terminal and not yet acknowledged).
    #[error("enrollment session already exists for member {active_actor}")]
    SessionConflict { active_actor: String },

    #[error("no active enrollment session")]
    NoActiveSession,

    /// The device did not confirm a cancel. The session is cancelled locally anyway.
    #[error("remote cancel failed for member {actor_id}: {source}")]
    RemoteCancelFailure {
        actor_id: String,
        #[source]
        source: ChannelError,
    },

    #[error("enrollment failed: {0}")]
    EnrollmentFailure(String),

    /// Displayed as a kind of failure.
    #[error("enrollment failed: timed out ({0})")]
    TimeoutAbandonment(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("coordinator stopped")]
    CoordinatorStopped,
}

impl EngineError {
    /// The failure a terminal session represents, if any.
    pub fn from_terminal(session: &EnrollmentSession) -> Option<Self> {
        let reason = || {
            session
                .failure_reason
                .clone()
                .unwrap_or_else(|| "no reason given".to_string())
        };
        match session.status {
            SessionStatus::Failed => Some(Self::EnrollmentFailure(reason())),
            SessionStatus::TimedOut => Some(Self::TimeoutAbandonment(reason())),
            _ => None,
        }
    }

    /// `EnrollmentFailure` or `TimeoutAbandonment`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::EnrollmentFailure(_) | Self::TimeoutAbandonment(_))
    }
}
