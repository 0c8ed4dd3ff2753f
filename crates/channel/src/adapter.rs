//! Notification Channel Adapter.
//!
//! Merges the push connection and the event-log poll into one stream of
//! [`NormalizedEvent`]s. Two independent Tokio tasks feed a shared `mpsc`
//! channel, so delivery order holds per source but not across sources.
//!
//! ```text
//! ┌─────────────┐  PushMessage   ┌────────────┐
//! │ PushSource  │───────────────▶│            │
//! └─────────────┘                │ normalize  │──▶ mpsc<NormalizedEvent>
//! ┌─────────────┐  EventRecord   │            │
//! │ EventLog    │───────────────▶│            │
//! └─────────────┘   (2s poll)    └────────────┘
//! ```
//!
//! Transport errors never leave this module: they are logged and the loop
//! retries on its own cadence. The adapter never touches session state; the
//! poll loop only reads the [`TrackedSession`] the coordinator publishes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use enrollsync_core::config::ChannelConfig;
use enrollsync_core::NormalizedEvent;

use crate::error::ChannelError;
use crate::normalize::{normalize_log_row, normalize_push};
use crate::traits::{EventLogSource, PushSource};

/// Buffer between the channel loops and the coordinator.
const EVENT_BUFFER: usize = 256;

/// What the poll loop needs to know about the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSession {
    pub actor_id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_event_id: Option<i64>,
}

/// Shared "push channel degraded" flag.
///
/// Set while the push connection is down; the poll loop keeps working
/// regardless.
#[derive(Debug, Clone, Default)]
pub struct DegradedFlag(Arc<AtomicBool>);

impl DegradedFlag {
    pub fn is_degraded(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Store a new value, returning the previous one.
    pub fn set(&self, degraded: bool) -> bool {
        self.0.swap(degraded, Ordering::SeqCst)
    }
}

/// Handles of the running channel loops.
pub struct ChannelTasks {
    degraded: DegradedFlag,
    handles: Vec<JoinHandle<()>>,
}

impl ChannelTasks {
    pub fn degraded(&self) -> DegradedFlag {
        self.degraded.clone()
    }

    /// Abort both loops.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        info!("notification channel stopped");
    }
}

/// Builder/owner of the two channel loops.
pub struct NotificationChannel {
    push: Arc<dyn PushSource>,
    log: Arc<dyn EventLogSource>,
    config: ChannelConfig,
    degraded: DegradedFlag,
}

impl NotificationChannel {
    pub fn new(
        push: Arc<dyn PushSource>,
        log: Arc<dyn EventLogSource>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            push,
            log,
            config,
            degraded: DegradedFlag::default(),
        }
    }

    pub fn degraded_flag(&self) -> DegradedFlag {
        self.degraded.clone()
    }

    /// Start the push and poll loops.
    ///
    /// Returns the single normalized event subscription and the task
    /// handles. Both loops exit on their own once the receiver is dropped.
    pub fn spawn(
        self,
        tracking: watch::Receiver<Option<TrackedSession>>,
    ) -> (mpsc::Receiver<NormalizedEvent>, ChannelTasks) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        info!(
            push = self.push.name(),
            poll_interval_ms = self.config.poll_interval_ms,
            poll_limit = self.config.poll_limit,
            "starting notification channel"
        );

        let push_handle = tokio::spawn(run_push_loop(
            self.push.clone(),
            tx.clone(),
            self.degraded.clone(),
            self.config.clone(),
        ));

        let poll_handle = tokio::spawn(run_poll_loop(
            self.log.clone(),
            tx,
            tracking,
            self.config.poll_interval(),
            self.config.poll_limit,
        ));

        (
            rx,
            ChannelTasks {
                degraded: self.degraded,
                handles: vec![push_handle, poll_handle],
            },
        )
    }
}

// ── Push loop ───────────────────────────────────────────────────────

async fn run_push_loop(
    source: Arc<dyn PushSource>,
    tx: mpsc::Sender<NormalizedEvent>,
    degraded: DegradedFlag,
    config: ChannelConfig,
) {
    let initial_backoff = config.reconnect_initial();
    let max_backoff = config.reconnect_max();
    let idle_timeout = config.push_idle_timeout();
    let mut backoff = initial_backoff;

    loop {
        match source.connect().await {
            Ok(mut conn) => {
                if degraded.set(false) {
                    info!(source = source.name(), "push channel recovered");
                }
                backoff = initial_backoff;

                loop {
                    let item = match tokio::time::timeout(idle_timeout, conn.next()).await {
                        Ok(Some(item)) => item,
                        Ok(None) => break,
                        Err(_) => {
                            warn!(
                                source = source.name(),
                                idle_ms = idle_timeout.as_millis() as u64,
                                "push connection idle, reconnecting"
                            );
                            break;
                        }
                    };
                    match item {
                        Ok(msg) => {
                            let Some(event) = normalize_push(&msg, Utc::now()) else {
                                continue;
                            };
                            debug!(
                                actor_id = %event.actor_id,
                                kind = event.kind.label(),
                                "push event received"
                            );
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        // A single bad frame does not cost us the connection.
                        Err(ChannelError::Decode(e)) => {
                            warn!(source = source.name(), error = %e, "dropping undecodable push frame");
                        }
                        Err(e) => {
                            warn!(source = source.name(), error = %e, "push connection error");
                            break;
                        }
                    }
                }
                warn!(source = source.name(), "push connection lost");
            }
            Err(e) => {
                warn!(
                    source = source.name(),
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "push connect failed"
                );
            }
        }

        if !degraded.set(true) {
            info!(source = source.name(), "push channel degraded, poll fallback only");
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

// ── Poll loop ───────────────────────────────────────────────────────

/// Per-session memory of which log rows were already emitted.
#[derive(Debug, Default)]
pub struct PollCursor {
    session: Option<(String, DateTime<Utc>)>,
    emitted: HashSet<i64>,
}

impl PollCursor {
    /// Forget emitted ids when the tracked session changes.
    fn align(&mut self, tracked: &TrackedSession) {
        let key = (tracked.actor_id.clone(), tracked.started_at);
        if self.session.as_ref() != Some(&key) {
            self.session = Some(key);
            self.emitted.clear();
        }
    }

    fn reset(&mut self) {
        self.session = None;
        self.emitted.clear();
    }
}

/// Fetch one batch of log rows for the tracked session and convert the new
/// ones, oldest first.
///
/// Skips rows older than the session start, the row matching
/// `last_seen_event_id`, and rows already emitted for this session.
pub async fn poll_once(
    source: &dyn EventLogSource,
    tracked: &TrackedSession,
    limit: u32,
    cursor: &mut PollCursor,
) -> Result<Vec<NormalizedEvent>, ChannelError> {
    cursor.align(tracked);

    let mut rows = source.recent_events(&tracked.actor_id, limit).await?;
    rows.sort_by_key(|r| (r.timestamp, r.id));

    let mut events = Vec::new();
    for row in rows {
        // A row stamped exactly at session start belongs to the session.
        if row.timestamp < tracked.started_at || Some(row.id) == tracked.last_seen_event_id {
            continue;
        }
        if !cursor.emitted.insert(row.id) {
            continue;
        }
        if let Some(event) = normalize_log_row(&row, &tracked.actor_id) {
            events.push(event);
        }
    }
    Ok(events)
}

async fn run_poll_loop(
    source: Arc<dyn EventLogSource>,
    tx: mpsc::Sender<NormalizedEvent>,
    tracking: watch::Receiver<Option<TrackedSession>>,
    interval: Duration,
    limit: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cursor = PollCursor::default();

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }

        let tracked = tracking.borrow().clone();
        let Some(tracked) = tracked else {
            cursor.reset();
            continue;
        };

        let events = match poll_once(&*source, &tracked, limit, &mut cursor).await {
            Ok(events) => events,
            Err(e) => {
                warn!(actor_id = %tracked.actor_id, error = %e, "event-log poll failed");
                continue;
            }
        };

        for event in events {
            debug!(
                actor_id = %event.actor_id,
                event_id = ?event.event_id,
                kind = event.kind.label(),
                "poll event received"
            );
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}
