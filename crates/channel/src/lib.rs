//! Notification channels for enrollment sessions.
//!
//! This crate provides:
//! - Wire formats for push messages and the REST envelope
//! - Normalization of push messages and event-log rows into `NormalizedEvent`s
//! - Collaborator traits (`PushSource`, `EventLogSource`, `EventsApi`, `DeviceControl`)
//!   with `reqwest` implementations
//! - The adapter that runs the push and poll loops

pub mod adapter;
pub mod error;
pub mod http;
pub mod normalize;
pub mod traits;
pub mod wire;

pub use adapter::{ChannelTasks, DegradedFlag, NotificationChannel, TrackedSession};
pub use error::ChannelError;
pub use http::{ApiClient, HttpPushSource};
pub use traits::{DeviceControl, EventLogSource, EventsApi, PushConnection, PushSource};
pub use wire::PushMessage;
