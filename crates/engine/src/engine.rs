//! Wiring: adapter → coordinator → facade.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use enrollsync_channel::{
    ApiClient, ChannelError, ChannelTasks, DeviceControl, EventLogSource, EventsApi,
    HttpPushSource, NotificationChannel, PushSource,
};
use enrollsync_core::config::ApiConfig;
use enrollsync_core::Config;

use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::facade::QueryFacade;

/// External collaborators the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub push: Arc<dyn PushSource>,
    pub event_log: Arc<dyn EventLogSource>,
    pub events_api: Arc<dyn EventsApi>,
    pub device: Arc<dyn DeviceControl>,
}

impl Collaborators {
    /// HTTP implementations against the configured API.
    pub fn http(config: &ApiConfig) -> Result<Self, ChannelError> {
        let api = Arc::new(ApiClient::new(config)?);
        Ok(Self {
            push: Arc::new(HttpPushSource::new(config)?),
            event_log: api.clone(),
            events_api: api.clone(),
            device: api,
        })
    }
}

/// A running engine: channel loops, coordinator task and query facade.
pub struct EnrollmentEngine {
    handle: CoordinatorHandle,
    facade: Arc<QueryFacade>,
    channel: ChannelTasks,
    coordinator: JoinHandle<()>,
}

impl EnrollmentEngine {
    /// Spawn every task. Must be called inside a Tokio runtime.
    pub fn start(config: &Config, collaborators: Collaborators) -> Self {
        let (tracking_tx, tracking_rx) = watch::channel(None);

        let channel = NotificationChannel::new(
            collaborators.push,
            collaborators.event_log,
            config.channel.clone(),
        );
        let (events, channel) = channel.spawn(tracking_rx);

        let (handle, coordinator) =
            Coordinator::spawn(&config.session, events, tracking_tx, collaborators.device);

        let facade = Arc::new(QueryFacade::new(
            collaborators.events_api,
            config.cache.capacity,
            handle.snapshot_watch(),
            channel.degraded(),
        ));

        info!(profile = config.profile_label(), "enrollment engine started");

        Self {
            handle,
            facade,
            channel,
            coordinator,
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn facade(&self) -> Arc<QueryFacade> {
        self.facade.clone()
    }

    /// Stop the channel loops and the coordinator.
    pub async fn shutdown(self) {
        self.channel.shutdown();
        self.handle.shutdown().await;
        if let Err(e) = self.coordinator.await {
            warn!(error = %e, "coordinator task ended abnormally");
        }
        info!("enrollment engine stopped");
    }
}
