//! Collaborator seams: push transport, event-log poll, events query, device control.

use async_trait::async_trait;
use futures::stream::BoxStream;

use enrollsync_core::{EventPage, EventQuery, EventRecord};

use crate::error::ChannelError;
use crate::wire::PushMessage;

/// An open push connection. The stream ends (or yields an error) when the
/// connection drops; the push loop then reconnects.
pub type PushConnection = BoxStream<'static, Result<PushMessage, ChannelError>>;

/// Source of the long-lived push connection.
#[async_trait]
pub trait PushSource: Send + Sync {
    /// Open (or re-open) the connection and subscribe to enrollment messages.
    async fn connect(&self) -> Result<PushConnection, ChannelError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "push"
    }
}

/// The shared status/event log, polled as a fallback.
#[async_trait]
pub trait EventLogSource: Send + Sync {
    /// Most recent `limit` rows for one member, newest first.
    async fn recent_events(
        &self,
        actor_id: &str,
        limit: u32,
    ) -> Result<Vec<EventRecord>, ChannelError>;
}

/// Paginated events query backing the events browser.
#[async_trait]
pub trait EventsApi: Send + Sync {
    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, ChannelError>;
}

/// Commands sent to the remote capture device.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn request_start(&self, actor_id: &str, actor_name: &str) -> Result<(), ChannelError>;

    async fn request_cancel(&self, actor_id: &str) -> Result<(), ChannelError>;
}
