//! Reconciliation Coordinator.
//!
//! [`Reconciler`] is the synchronous core: it owns the session, runs inputs
//! through the state machine, suppresses re-delivered event ids and reports
//! a [`SessionChange`] only when the visible state actually changed.
//!
//! [`Coordinator`] runs a `Reconciler` on one Tokio task. Consumer commands,
//! channel events and timeout ticks all arrive through one `select!`, and
//! each is processed to completion before the next, so the session needs no
//! lock. [`CoordinatorHandle`] is the consumer surface.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use enrollsync_channel::{DeviceControl, TrackedSession};
use enrollsync_core::config::SessionConfig;
use enrollsync_core::{EnrollmentSession, NormalizedEvent, SessionSnapshot, SessionStatus};

use crate::error::EngineError;
use crate::machine::{transition, Input, TimeoutPolicy, Transition};

const COMMAND_BUFFER: usize = 64;
const CHANGE_BUFFER: usize = 64;

/// Reason recorded on operator-initiated cancels.
pub const OPERATOR_CANCEL_REASON: &str = "cancelled by operator";

/// A visible state change, published exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionChange {
    pub previous: SessionSnapshot,
    pub current: SessionSnapshot,
    pub at: DateTime<Utc>,
}

impl SessionChange {
    /// A successful enrollment changes member data; listings should be re-queried.
    pub fn requires_refresh(&self) -> bool {
        self.current.status == SessionStatus::Succeeded
            && self.previous.status != SessionStatus::Succeeded
    }

    pub fn entered_terminal(&self) -> bool {
        self.current.status.is_terminal() && !self.previous.status.is_terminal()
    }

    /// A different attempt than before (including Idle → Started).
    pub fn started_new_attempt(&self) -> bool {
        let prev = self.previous.session.as_ref().map(|s| s.attempt_id);
        let curr = self.current.session.as_ref().map(|s| s.attempt_id);
        curr.is_some() && curr != prev
    }
}

// ── Reconciler ──────────────────────────────────────────────────────

pub struct Reconciler {
    session: Option<EnrollmentSession>,
    /// Event ids applied to the current attempt.
    applied_ids: HashSet<i64>,
    policy: TimeoutPolicy,
}

impl Reconciler {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            session: None,
            applied_ids: HashSet::new(),
            policy,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::of(self.session.as_ref())
    }

    /// True while a session is `Started`/`InProgress`.
    pub fn is_active(&self) -> bool {
        self.session.as_ref().map(|s| s.is_active()).unwrap_or(false)
    }

    /// What the poll loop should filter on; `None` unless a session is active.
    pub fn tracked(&self) -> Option<TrackedSession> {
        self.session
            .as_ref()
            .filter(|s| s.is_active())
            .map(|s| TrackedSession {
                actor_id: s.actor_id.clone(),
                started_at: s.started_at,
                last_seen_event_id: s.last_seen_event_id,
            })
    }

    pub fn on_normalized_event(
        &mut self,
        event: &NormalizedEvent,
        now: DateTime<Utc>,
    ) -> Option<SessionChange> {
        if let Some(id) = event.event_id {
            if self.is_active() && self.applied_ids.contains(&id) {
                debug!(event_id = id, channel = %event.source_channel, "ignoring re-delivered event");
                return None;
            }
        }

        match self.apply(Input::Event(event), now) {
            Ok(change) => {
                if let (Some(_), Some(id)) = (&change, event.event_id) {
                    self.applied_ids.insert(id);
                }
                change
            }
            Err(e) => {
                warn!(error = %e, "event rejected by state machine");
                None
            }
        }
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<SessionChange> {
        self.apply(Input::Tick, now).unwrap_or_else(|e| {
            warn!(error = %e, "timeout check rejected");
            None
        })
    }

    pub fn start_session(
        &mut self,
        actor_id: &str,
        actor_name: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionChange, EngineError> {
        self.apply(Input::Start { actor_id, actor_name }, now)?
            .ok_or(EngineError::NoActiveSession)
    }

    pub fn cancel_session(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionChange, EngineError> {
        self.apply(Input::Cancel { reason }, now)?
            .ok_or(EngineError::NoActiveSession)
    }

    /// Clear a terminal session back to Idle. `Ok(None)` when already idle.
    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> Result<Option<SessionChange>, EngineError> {
        self.apply(Input::Acknowledge, now)
    }

    fn apply(
        &mut self,
        input: Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionChange>, EngineError> {
        let next = match transition(self.session.as_ref(), input, now, &self.policy)? {
            Transition::Apply(next) => next,
            Transition::Ignore(reason) => {
                if let Input::Event(event) = input {
                    debug!(
                        actor_id = %event.actor_id,
                        event_id = ?event.event_id,
                        channel = %event.source_channel,
                        kind = event.kind.label(),
                        ?reason,
                        "event ignored"
                    );
                }
                return Ok(None);
            }
        };

        let previous = self.snapshot();
        let attempt_changed = previous.session.as_ref().map(|s| s.attempt_id)
            != next.as_ref().map(|s| s.attempt_id);
        if attempt_changed {
            self.applied_ids.clear();
        }
        self.session = next;

        let current = self.snapshot();
        if current == previous {
            return Ok(None);
        }

        if let Some(s) = &current.session {
            info!(
                actor_id = %s.actor_id,
                attempt_id = %s.attempt_id,
                from = %previous.status,
                to = %current.status,
                "enrollment session transition"
            );
        } else {
            info!(from = %previous.status, "enrollment session cleared");
        }

        Ok(Some(SessionChange {
            previous,
            current,
            at: now,
        }))
    }
}

// ── Coordinator task ────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Start {
        actor_id: String,
        actor_name: String,
        reply: Reply<EnrollmentSession>,
    },
    Cancel {
        reason: String,
        reply: Reply<EnrollmentSession>,
    },
    Acknowledge {
        reply: Reply<()>,
    },
    Deliver(NormalizedEvent),
    Shutdown,
}

/// Single serialization point for every session mutation.
pub struct Coordinator {
    reconciler: Reconciler,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<NormalizedEvent>,
    tick_interval: Duration,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    tracking_tx: watch::Sender<Option<TrackedSession>>,
    changes: broadcast::Sender<SessionChange>,
}

impl Coordinator {
    /// Spawn the coordinator task.
    ///
    /// `events` is the adapter's normalized subscription; `tracking_tx` feeds
    /// the adapter's poll loop.
    pub fn spawn(
        config: &SessionConfig,
        events: mpsc::Receiver<NormalizedEvent>,
        tracking_tx: watch::Sender<Option<TrackedSession>>,
        device: Arc<dyn DeviceControl>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle());
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        let coordinator = Self {
            reconciler: Reconciler::new(TimeoutPolicy::from_config(config)),
            commands,
            events,
            tick_interval: config.tick_interval(),
            snapshot_tx,
            tracking_tx,
            changes: changes.clone(),
        };

        let handle = CoordinatorHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            changes,
            device,
        };

        (handle, tokio::spawn(coordinator.run()))
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        info!(tick_ms = self.tick_interval.as_millis() as u64, "coordinator started");

        loop {
            let armed = self.reconciler.is_active();
            let change = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.reconciler.on_normalized_event(&event, Utc::now()),
                    None => {
                        warn!("notification channel closed");
                        events_open = false;
                        None
                    }
                },
                _ = ticker.tick(), if armed => self.reconciler.tick(Utc::now()),
            };

            if let Some(change) = change {
                if change.started_new_attempt() {
                    ticker.reset();
                }
                self.publish(change);
            }
        }

        info!("coordinator stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> Option<SessionChange> {
        let now = Utc::now();
        match cmd {
            Command::Start {
                actor_id,
                actor_name,
                reply,
            } => {
                let result = self.reconciler.start_session(&actor_id, &actor_name, now);
                respond(reply, result, |c| c.current.session.clone())
            }
            Command::Cancel { reason, reply } => {
                let result = self.reconciler.cancel_session(&reason, now);
                respond(reply, result, |c| c.current.session.clone())
            }
            Command::Acknowledge { reply } => match self.reconciler.acknowledge(now) {
                Ok(change) => {
                    let _ = reply.send(Ok(()));
                    change
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    None
                }
            },
            Command::Deliver(event) => self.reconciler.on_normalized_event(&event, now),
            Command::Shutdown => None,
        }
    }

    fn publish(&mut self, change: SessionChange) {
        self.snapshot_tx.send_replace(change.current.clone());

        let tracked = self.reconciler.tracked();
        self.tracking_tx.send_if_modified(|current| {
            if *current != tracked {
                *current = tracked;
                true
            } else {
                false
            }
        });

        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

/// Reply to a command whose success value is derived from the change.
fn respond(
    reply: Reply<EnrollmentSession>,
    result: Result<SessionChange, EngineError>,
    session_of: impl Fn(&SessionChange) -> Option<EnrollmentSession>,
) -> Option<SessionChange> {
    match result {
        Ok(change) => {
            let payload = session_of(&change).ok_or(EngineError::NoActiveSession);
            let _ = reply.send(payload);
            Some(change)
        }
        Err(e) => {
            let _ = reply.send(Err(e));
            None
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Outcome of a cancel that the device acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub session: EnrollmentSession,
}

/// Consumer-facing operations. Cheap to clone.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    changes: broadcast::Sender<SessionChange>,
    device: Arc<dyn DeviceControl>,
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| EngineError::CoordinatorStopped)?;
        rx.await.map_err(|_| EngineError::CoordinatorStopped)?
    }

    /// Start a session locally, then ask the device to begin capturing.
    ///
    /// A failed device request is logged; the channels still report the
    /// outcome (or the timeout abandons the attempt).
    pub async fn start_session(
        &self,
        actor_id: &str,
        actor_name: &str,
    ) -> Result<EnrollmentSession, EngineError> {
        let session = self
            .request(|reply| Command::Start {
                actor_id: actor_id.to_string(),
                actor_name: actor_name.to_string(),
                reply,
            })
            .await?;

        if let Err(e) = self.device.request_start(&session.actor_id, &session.actor_name).await {
            warn!(
                actor_id = %session.actor_id,
                attempt_id = %session.attempt_id,
                error = %e,
                "device start request failed"
            );
        }
        Ok(session)
    }

    /// Cancel the active session.
    ///
    /// The local state is `Cancelled` as soon as this returns, whatever the
    /// device answers. A device failure comes back as
    /// [`EngineError::RemoteCancelFailure`].
    pub async fn cancel_session(&self) -> Result<CancelOutcome, EngineError> {
        let session = self
            .request(|reply| Command::Cancel {
                reason: OPERATOR_CANCEL_REASON.to_string(),
                reply,
            })
            .await?;

        match self.device.request_cancel(&session.actor_id).await {
            Ok(()) => Ok(CancelOutcome { session }),
            Err(e) => {
                warn!(
                    actor_id = %session.actor_id,
                    error = %e,
                    "remote cancel failed; session cancelled locally"
                );
                Err(EngineError::RemoteCancelFailure {
                    actor_id: session.actor_id,
                    source: e,
                })
            }
        }
    }

    /// Clear a terminal session so a new one may start.
    pub async fn acknowledge(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Acknowledge { reply }).await
    }

    /// Feed an event through the same queue as the channels.
    pub async fn deliver(&self, event: NormalizedEvent) -> Result<(), EngineError> {
        self.commands
            .send(Command::Deliver(event))
            .await
            .map_err(|_| EngineError::CoordinatorStopped)
    }

    /// Stop the coordinator task. Later requests fail with
    /// [`EngineError::CoordinatorStopped`].
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("coordinator already stopped");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn snapshot_watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Change notifications, one per visible change.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use enrollsync_core::{EventKind, SourceChannel};

    fn t0() -> DateTime<Utc> {
        "2024-05-01T10:00:00Z".parse().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    fn poll(id: i64, kind: EventKind, secs: i64) -> NormalizedEvent {
        NormalizedEvent::new(SourceChannel::Poll, "42", kind, at(secs)).with_event_id(id)
    }

    fn push(kind: EventKind, secs: i64) -> NormalizedEvent {
        NormalizedEvent::new(SourceChannel::Push, "42", kind, at(secs))
    }

    fn started() -> Reconciler {
        let mut r = Reconciler::new(TimeoutPolicy::default());
        r.start_session("42", "Jane", t0()).unwrap();
        r
    }

    #[test]
    fn duplicate_ids_never_transition_twice() {
        let mut r = started();
        let p1 = poll(5, EventKind::ProgressUpdate("scan 1".into()), 2);
        let p2 = poll(6, EventKind::ProgressUpdate("scan 2".into()), 4);

        assert!(r.on_normalized_event(&p1, at(3)).is_some());
        assert!(r.on_normalized_event(&p2, at(5)).is_some());
        // p1 is not the last seen id any more, but it was already applied.
        assert!(r.on_normalized_event(&p1, at(6)).is_none());
        assert!(r.on_normalized_event(&p2, at(7)).is_none());

        let snap = r.snapshot();
        assert_eq!(snap.last_seen_event_id(), Some(6));
        assert_eq!(snap.session.unwrap().last_progress_at, Some(at(5)));
    }

    #[test]
    fn foreign_actor_events_are_dropped() {
        let mut r = started();
        let before = r.snapshot();
        let foreign = NormalizedEvent::new(SourceChannel::Push, "99", EventKind::Succeeded, at(1));
        assert!(r.on_normalized_event(&foreign, at(1)).is_none());
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn push_and_poll_report_the_same_success_once() {
        let mut r = started();
        let change = r.on_normalized_event(&push(EventKind::Succeeded, 5), at(5)).unwrap();
        assert!(change.requires_refresh());
        assert!(change.entered_terminal());
        assert!(r.on_normalized_event(&poll(7, EventKind::Succeeded, 5), at(6)).is_none());
        assert_eq!(r.snapshot().status, SessionStatus::Succeeded);
        assert_eq!(r.tracked(), None, "terminal sessions are not tracked");
    }

    #[test]
    fn replayed_start_for_active_actor_is_noop() {
        let mut r = started();
        let replay = push(EventKind::Started { actor_name: Some("Jane".into()) }, 3);
        assert!(r.on_normalized_event(&replay, at(3)).is_none());
        assert_eq!(r.snapshot().status, SessionStatus::Started);
    }

    #[test]
    fn second_start_conflicts_until_acknowledged() {
        let mut r = started();
        r.on_normalized_event(&push(EventKind::Succeeded, 1), at(1));
        assert!(matches!(
            r.start_session("42", "Jane", at(2)),
            Err(EngineError::SessionConflict { .. })
        ));

        let cleared = r.acknowledge(at(3)).unwrap().unwrap();
        assert_eq!(cleared.current.status, SessionStatus::Idle);
        assert!(r.acknowledge(at(4)).unwrap().is_none(), "idle acknowledge is a no-op");

        let change = r.start_session("7", "Bo", at(5)).unwrap();
        assert!(change.started_new_attempt());
    }

    #[test]
    fn applied_ids_reset_per_attempt() {
        let mut r = started();
        r.on_normalized_event(&poll(7, EventKind::Succeeded, 1), at(1));
        r.acknowledge(at(2)).unwrap();
        r.start_session("42", "Jane", at(3)).unwrap();
        let change = r.on_normalized_event(&poll(7, EventKind::Succeeded, 4), at(4));
        assert!(change.is_some(), "ids from a previous attempt do not block a new one");
    }

    #[test]
    fn tick_times_out_and_reports_once() {
        let mut r = started();
        assert!(r.tick(at(100)).is_none());
        let change = r.tick(at(181)).unwrap();
        assert_eq!(change.current.status, SessionStatus::TimedOut);
        assert!(!change.requires_refresh());
        assert!(r.tick(at(300)).is_none());
    }

    #[test]
    fn progress_keeps_session_alive_past_window() {
        let mut r = started();
        r.on_normalized_event(&push(EventKind::ProgressUpdate("scan 3".into()), 170), at(170));
        assert!(r.tick(at(181)).is_none());
        assert_eq!(r.snapshot().status, SessionStatus::InProgress);
    }

    #[test]
    fn tracked_reflects_last_seen_id() {
        let mut r = started();
        let tracked = r.tracked().unwrap();
        assert_eq!(tracked.actor_id, "42");
        assert_eq!(tracked.started_at, t0());
        assert_eq!(tracked.last_seen_event_id, None);

        r.on_normalized_event(&poll(11, EventKind::ProgressUpdate("x".into()), 1), at(1));
        assert_eq!(r.tracked().unwrap().last_seen_event_id, Some(11));
    }

    #[test]
    fn cancel_is_terminal_and_idle_cancel_errors() {
        let mut r = started();
        let change = r.cancel_session(OPERATOR_CANCEL_REASON, at(1)).unwrap();
        assert_eq!(change.current.status, SessionStatus::Cancelled);
        assert!(matches!(
            r.cancel_session(OPERATOR_CANCEL_REASON, at(2)),
            Err(EngineError::NoActiveSession)
        ));
    }
}
