//! Session State Machine.
//!
//! [`transition`] is a pure function of the current session, one input and
//! the current time. It never performs I/O and never mutates its arguments;
//! the coordinator decides what to do with the result.
//!
//! ```text
//!            start / Started
//!   Idle ─────────────────────▶ Started ──progress──▶ InProgress ◀─┐
//!    ▲                             │                     │  progress
//!    │ acknowledge                 └──────────┬──────────┘─────────┘
//!    │                                        │ Succeeded / Failed /
//!    └──────── terminal ◀─────────────────────┘ Cancelled / tick timeout
//! ```

use chrono::{DateTime, Duration, Utc};

use enrollsync_core::config::SessionConfig;
use enrollsync_core::{EnrollmentSession, EventKind, NormalizedEvent, SessionStatus};

use crate::error::EngineError;

/// Two-part abandonment rule.
///
/// A session times out when the time since the last progress (or the start)
/// exceeds `window` AND no progress was seen within the trailing
/// `progress_grace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub window: Duration,
    pub progress_grace: Duration,
}

impl TimeoutPolicy {
    pub fn new(window_ms: u64, progress_grace_ms: u64) -> Self {
        Self {
            window: millis(window_ms),
            progress_grace: millis(progress_grace_ms),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.timeout_window_ms, config.progress_grace_ms)
    }

    pub fn is_expired(&self, session: &EnrollmentSession, now: DateTime<Utc>) -> bool {
        let idle_too_long = now - session.last_activity_at() > self.window;
        let recent_progress = session
            .last_progress_at
            .map(|at| now - at <= self.progress_grace)
            .unwrap_or(false);
        idle_too_long && !recent_progress
    }
}

/// Saturates instead of wrapping for values past `i64::MAX`.
fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Everything that can drive the machine.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    Start { actor_id: &'a str, actor_name: &'a str },
    Event(&'a NormalizedEvent),
    Cancel { reason: &'a str },
    Tick,
    Acknowledge,
}

/// Why an input produced no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    DuplicateEvent,
    StaleEvent,
    ForeignActor,
    NoActiveSession,
    Terminal,
    AlreadyStarted,
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Replace the state; `None` is Idle.
    Apply(Option<EnrollmentSession>),
    Ignore(IgnoreReason),
}

/// Compute the next state for `input`.
///
/// Commands that violate the single-session rule are rejected with an
/// error; channel events and ticks never error, they are applied or ignored.
pub fn transition(
    state: Option<&EnrollmentSession>,
    input: Input<'_>,
    now: DateTime<Utc>,
    policy: &TimeoutPolicy,
) -> Result<Transition, EngineError> {
    use Transition::{Apply, Ignore};

    let next = match (state, input) {
        (None, Input::Start { actor_id, actor_name }) => {
            Apply(Some(EnrollmentSession::start(actor_id, actor_name, now)))
        }
        (Some(current), Input::Start { .. }) => {
            return Err(EngineError::SessionConflict {
                active_actor: current.actor_id.clone(),
            })
        }

        (None, Input::Event(event)) => match &event.kind {
            EventKind::Started { actor_name } => {
                let mut session = EnrollmentSession::start(
                    event.actor_id.clone(),
                    actor_name.clone().unwrap_or_default(),
                    now,
                );
                session.last_seen_event_id = event.event_id;
                Apply(Some(session))
            }
            _ => Ignore(IgnoreReason::NoActiveSession),
        },
        (Some(current), Input::Event(_)) if current.is_terminal() => Ignore(IgnoreReason::Terminal),
        (Some(current), Input::Event(event)) => apply_event(current, event, now),

        (Some(current), Input::Cancel { reason }) if current.is_active() => {
            Apply(Some(finish(current, SessionStatus::Cancelled, Some(reason.to_string()))))
        }
        (_, Input::Cancel { .. }) => return Err(EngineError::NoActiveSession),

        (Some(current), Input::Tick) if current.is_active() => {
            if policy.is_expired(current, now) {
                let reason = format!(
                    "no progress for {}s",
                    (now - current.last_activity_at()).num_seconds()
                );
                Apply(Some(finish(current, SessionStatus::TimedOut, Some(reason))))
            } else {
                Ignore(IgnoreReason::NotDue)
            }
        }
        (Some(_), Input::Tick) => Ignore(IgnoreReason::Terminal),
        (None, Input::Tick) => Ignore(IgnoreReason::NoActiveSession),

        (Some(current), Input::Acknowledge) if current.is_terminal() => Apply(None),
        (Some(current), Input::Acknowledge) => {
            return Err(EngineError::SessionConflict {
                active_actor: current.actor_id.clone(),
            })
        }
        (None, Input::Acknowledge) => Ignore(IgnoreReason::NoActiveSession),
    };

    Ok(next)
}

fn apply_event(
    current: &EnrollmentSession,
    event: &NormalizedEvent,
    now: DateTime<Utc>,
) -> Transition {
    if event.actor_id != current.actor_id {
        return Transition::Ignore(IgnoreReason::ForeignActor);
    }
    if event.event_id.is_some() && event.event_id == current.last_seen_event_id {
        return Transition::Ignore(IgnoreReason::DuplicateEvent);
    }
    if event.observed_at < current.started_at {
        return Transition::Ignore(IgnoreReason::StaleEvent);
    }

    let mut next = match &event.kind {
        EventKind::Started { .. } => return Transition::Ignore(IgnoreReason::AlreadyStarted),
        EventKind::ProgressUpdate(step) => {
            let mut next = current.clone();
            next.status = SessionStatus::InProgress;
            next.last_progress_at = Some(now.max(current.started_at));
            next.current_step = Some(step.clone());
            next
        }
        EventKind::Succeeded => finish(current, SessionStatus::Succeeded, None),
        EventKind::Failed(reason) => finish(current, SessionStatus::Failed, Some(reason.clone())),
        EventKind::Cancelled(reason) => {
            finish(current, SessionStatus::Cancelled, Some(reason.clone()))
        }
    };

    if event.event_id.is_some() {
        next.last_seen_event_id = event.event_id;
    }
    Transition::Apply(Some(next))
}

fn finish(
    current: &EnrollmentSession,
    status: SessionStatus,
    reason: Option<String>,
) -> EnrollmentSession {
    let mut next = current.clone();
    next.status = status;
    next.failure_reason = reason;
    next
}
