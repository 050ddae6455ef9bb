//! Worker invocation seam and the reqwest-backed HTTP worker.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::AbortSignal;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, WorkerError>> + Send>>;

pub type WorkerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<WorkerResponse, WorkerError>> + Send + 'a>>;

const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Payload sent to the worker for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub run_id: String,
    pub installation_id: u64,
    pub repo: String,
    pub task: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_strategy: Option<String>,
    pub should_commit: bool,
}

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("worker invocation aborted")]
    Aborted,
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Body(String),
}

pub struct WorkerResponse {
    pub status: u16,
    content_type: Option<String>,
    body: Option<ByteStream>,
}

impl fmt::Debug for WorkerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl WorkerResponse {
    pub fn new(status: u16, content_type: Option<String>, body: Option<ByteStream>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    pub fn json(status: u16, payload: &Value) -> Self {
        Self::new(
            status,
            Some("application/json".to_string()),
            Some(once(Bytes::from(payload.to_string()))),
        )
    }

    pub fn text_body(status: u16, text: impl Into<String>) -> Self {
        Self::new(
            status,
            Some("text/plain".to_string()),
            Some(once(Bytes::from(text.into()))),
        )
    }

    pub fn event_stream(body: ByteStream) -> Self {
        Self::new(200, Some(EVENT_STREAM_CONTENT_TYPE.to_string()), Some(body))
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, None, None)
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE))
            .unwrap_or(false)
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn into_body(self) -> Option<ByteStream> {
        self.body
    }

    /// Reads the whole body; a missing body reads as empty.
    pub async fn text(self) -> Result<String, WorkerError> {
        let Some(mut body) = self.body else {
            return Ok(String::new());
        };
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub async fn json_body(self) -> Result<Value, WorkerError> {
        let text = self.text().await?;
        serde_json::from_str(&text)
            .map_err(|err| WorkerError::Body(format!("invalid worker JSON: {err}")))
    }
}

fn once(bytes: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(bytes) }))
}

/// Executes runs. The signal fires when the run is cancelled or times out.
pub trait Worker: Send + Sync + 'static {
    fn invoke(&self, request: WorkerRequest, signal: AbortSignal) -> WorkerFuture<'_>;
}

#[derive(Debug, Clone)]
pub struct HttpWorker {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpWorker {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| WorkerError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

impl Worker for HttpWorker {
    fn invoke(&self, request: WorkerRequest, signal: AbortSignal) -> WorkerFuture<'_> {
        Box::pin(async move {
            let mut builder = self
                .client
                .post(&self.url)
                .header(ACCEPT, "text/event-stream, application/json")
                .json(&request);
            if let Some(token) = self.token.as_deref() {
                builder = builder.bearer_auth(token);
            }

            let response = tokio::select! {
                biased;
                _ = signal.aborted() => return Err(WorkerError::Aborted),
                result = builder.send() => result.map_err(|err| {
                    tracing::warn!(
                        run_id = %request.run_id,
                        url = %self.url,
                        error = %err,
                        "http_worker: request failed"
                    );
                    WorkerError::Transport(err.to_string())
                })?,
            };

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            tracing::debug!(
                run_id = %request.run_id,
                status,
                content_type = ?content_type,
                "http_worker: response received"
            );

            if status == 204 || response.content_length() == Some(0) {
                return Ok(WorkerResponse::new(status, content_type, None));
            }

            let body: ByteStream = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|err| WorkerError::Body(err.to_string()))),
            );
            Ok(WorkerResponse::new(status, content_type, Some(body)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn json_response_reads_back() {
        let response = WorkerResponse::json(200, &json!({ "success": true }));
        assert!(response.is_ok());
        assert!(!response.is_event_stream());
        assert_eq!(
            response.json_body().await.expect("json"),
            json!({ "success": true })
        );
    }

    #[tokio::test]
    async fn text_concatenates_chunks() {
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"upstream ")),
            Ok(Bytes::from_static(b"exploded")),
        ]));
        let response = WorkerResponse::new(502, None, Some(body));
        assert!(!response.is_ok());
        assert_eq!(response.text().await.expect("text"), "upstream exploded");
        assert_eq!(WorkerResponse::empty(200).text().await.expect("text"), "");
    }

    #[test]
    fn event_stream_detection_ignores_parameters() {
        let response = WorkerResponse::new(
            200,
            Some("Text/Event-Stream; charset=utf-8".to_string()),
            None,
        );
        assert!(response.is_event_stream());
        assert!(!response.has_body());
    }
}
