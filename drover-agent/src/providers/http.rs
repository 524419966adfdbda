// ABOUTME: HTTP client for a session server - REST calls plus the SSE event stream.
// ABOUTME: Server-pushed `{type, properties}` events are decoded into ServerEvents.

use super::server::{EventStream, ServerClient};
use crate::error::{ProviderError, ProviderResult};
use crate::mapper::ServerEvent;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
}

/// reqwest-backed [`ServerClient`]
#[derive(Debug, Clone, Default)]
pub struct HttpServerClient {
    http: reqwest::Client,
}

impl HttpServerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

async fn check(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Request(format!("{}: {}", status, body)))
}

#[async_trait]
impl ServerClient for HttpServerClient {
    async fn create_session(&self, base_url: &str, directory: &Path) -> ProviderResult<String> {
        let response = self
            .http
            .post(endpoint(base_url, "session"))
            .query(&[("directory", directory.to_string_lossy())])
            .json(&json!({}))
            .send()
            .await?;
        let info: SessionInfo = check(response).await?.json().await?;
        Ok(info.id)
    }

    async fn get_session(&self, base_url: &str, session_id: &str) -> ProviderResult<()> {
        let response = self
            .http
            .get(endpoint(base_url, &format!("session/{}", session_id)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::SessionNotFound(session_id.to_string()));
        }
        check(response).await?;
        Ok(())
    }

    async fn prompt(&self, base_url: &str, session_id: &str, text: &str) -> ProviderResult<()> {
        let response = self
            .http
            .post(endpoint(base_url, &format!("session/{}/prompt_async", session_id)))
            .json(&json!({ "parts": [{ "type": "text", "text": text }] }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn abort(&self, base_url: &str, session_id: &str) -> ProviderResult<()> {
        let response = self
            .http
            .post(endpoint(base_url, &format!("session/{}/abort", session_id)))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn subscribe(&self, base_url: &str) -> ProviderResult<EventStream> {
        let response = self
            .http
            .get(endpoint(base_url, "event"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check(response).await?;
        Ok(parse_event_stream(response.bytes_stream()))
    }
}

/// Decode an SSE byte stream into server events.
///
/// Transport failures are yielded as errors; events whose data is not a
/// `{type, properties}` object are skipped.
pub fn parse_event_stream<S, B, E>(byte_stream: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    byte_stream
        .map(|result| result.map_err(|e| std::io::Error::other(e.to_string())))
        .eventsource()
        .filter_map(|result| async move {
            match result {
                Ok(event) => match serde_json::from_str::<ServerEvent>(&event.data) {
                    Ok(parsed) => Some(Ok(parsed)),
                    Err(e) => {
                        tracing::debug!(
                            error = %e,
                            data = %event.data,
                            "Skipping undecodable server event"
                        );
                        None
                    }
                },
                Err(e) => Some(Err(ProviderError::Stream(e.to_string()))),
            }
        })
        .boxed()
}
