//! `reqwest`-backed implementations of the collaborator traits.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use enrollsync_core::config::ApiConfig;
use enrollsync_core::{EventPage, EventQuery, EventRecord, Pagination};

use crate::error::ChannelError;
use crate::traits::{DeviceControl, EventLogSource, EventsApi, PushConnection, PushSource};
use crate::wire::{decode_push_frame, parse_rows, ApiEnvelope, CancelRequest, EventLogData, StartRequest};

/// Client for the console's REST API: event-log poll, events query and
/// device commands.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<ApiEnvelope<T>, ChannelError> {
        let response = self.client.get(self.url(path)).query(query).send().await?;
        decode_envelope(response).await
    }

    async fn post_command<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), ChannelError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let envelope: ApiEnvelope<Value> = decode_envelope(response).await?;
        envelope.into_result()?;
        debug!(path, "device command accepted");
        Ok(())
    }
}

/// Reject non-2xx responses with their body, then decode the JSON envelope.
async fn decode_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<ApiEnvelope<T>, ChannelError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(ChannelError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl EventLogSource for ApiClient {
    async fn recent_events(
        &self,
        actor_id: &str,
        limit: u32,
    ) -> Result<Vec<EventRecord>, ChannelError> {
        let envelope: ApiEnvelope<EventLogData> = self
            .get_envelope(
                "events",
                &[("limit", limit.to_string()), ("memberId", actor_id.to_string())],
            )
            .await?
            .into_result()?;
        let (records, errors) = parse_rows(envelope.data.unwrap_or_default().events);
        debug!(actor_id, rows = records.len(), skipped = errors.len(), "event-log poll decoded");
        Ok(records)
    }
}

#[async_trait]
impl EventsApi for ApiClient {
    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, ChannelError> {
        let mut params = vec![
            ("page", query.page.to_string()),
            ("limit", query.page_size.to_string()),
        ];
        if let Some(search) = &query.search {
            params.push(("search", search.clone()));
        }

        let envelope: ApiEnvelope<Vec<Value>> =
            self.get_envelope("events", &params).await?.into_result()?;
        let (rows, errors) = parse_rows(envelope.data.unwrap_or_default());
        if !errors.is_empty() {
            debug!(page = query.page, skipped = errors.len(), "events page had malformed rows");
        }
        let pagination = envelope.pagination.unwrap_or(Pagination {
            total: rows.len() as u64,
            page: query.page,
            limit: query.page_size,
            total_pages: 1,
        });
        Ok(EventPage { rows, pagination })
    }
}

#[async_trait]
impl DeviceControl for ApiClient {
    async fn request_start(&self, actor_id: &str, actor_name: &str) -> Result<(), ChannelError> {
        self.post_command(
            "enrollment/start",
            &StartRequest {
                member_id: actor_id,
                member_name: actor_name,
            },
        )
        .await
    }

    async fn request_cancel(&self, actor_id: &str) -> Result<(), ChannelError> {
        self.post_command("enrollment/cancel", &CancelRequest { member_id: actor_id })
            .await
    }
}

// ── Push stream ─────────────────────────────────────────────────────

/// Push source reading a streaming HTTP response (SSE or newline-delimited
/// JSON) from the capture-device gateway.
#[derive(Debug, Clone)]
pub struct HttpPushSource {
    url: String,
    /// No overall timeout: the response body is open-ended.
    client: reqwest::Client,
}

impl HttpPushSource {
    pub fn new(config: &ApiConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            url: config.push_url.clone(),
            client,
        })
    }
}

#[async_trait]
impl PushSource for HttpPushSource {
    async fn connect(&self) -> Result<PushConnection, ChannelError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(url = %self.url, "push stream connected");

        let frames = split_lines(Box::pin(response.bytes_stream())).filter_map(|line| async move {
            match line {
                Ok(line) => decode_push_frame(&line),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(frames.boxed())
    }

    fn name(&self) -> &str {
        "http-push"
    }
}

/// Re-chunk a byte stream into text lines. Lines keep their trailing
/// newline; the frame decoder trims them. A transport error is yielded once
/// and ends the stream.
pub fn split_lines<S, B, E>(chunks: S) -> impl Stream<Item = Result<String, ChannelError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ChannelError> + Send + 'static,
{
    futures::stream::unfold(
        (chunks, Vec::<u8>::new(), false),
        |(mut chunks, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Some((Ok(text), (chunks, buf, done)));
                }
                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    return Some((Ok(text), (chunks, Vec::new(), true)));
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => return Some((Err(e.into()), (chunks, Vec::new(), true))),
                    None => done = true,
                }
            }
        },
    )
}
