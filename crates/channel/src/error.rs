//! Channel transport error types.

use thiserror::Error;

/// Failures on the push connection, the poll source, or the REST API.
///
/// These never reach the session state machine; the adapter logs them and
/// retries on its own cadence.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API reported failure: {0}")]
    Api(String),

    #[error("connection closed by peer")]
    Closed,
}
