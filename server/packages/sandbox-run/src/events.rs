//! Run lifecycle events and SSE framing.
//!
//! Workers report progress as `data: <json>\n\n` frames. Every frame is a JSON
//! object with a `type` field; lifecycle types map onto [`RunEvent`] and any
//! other type is passed through as [`RunEvent::Other`].

use bytes::Bytes;
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const RUN_STARTED: &str = "run_started";
pub const RUN_COMPLETED: &str = "run_completed";
pub const RUN_FAILED: &str = "run_failed";
pub const RUN_CANCELLED: &str = "run_cancelled";
pub const RUN_PAUSED: &str = "run_paused";
pub const RUN_RESUMED: &str = "run_resumed";

pub const TIMEOUT_ERROR_TYPE: &str = "timeout";

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started,
    Completed {
        result: Option<Value>,
    },
    Failed {
        error: Option<String>,
        error_type: Option<String>,
    },
    Cancelled {
        message: Option<String>,
    },
    Paused {
        message: Option<String>,
    },
    Resumed {
        message: Option<String>,
    },
    /// Progress/log events that do not affect the lifecycle.
    Other {
        event_type: String,
    },
}

impl RunEvent {
    pub fn from_value(value: &Value) -> Result<Self, FrameError> {
        let object = value.as_object().ok_or(FrameError::NotAnObject)?;
        let event_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?;

        let event = match event_type {
            RUN_STARTED => Self::Started,
            RUN_COMPLETED => Self::Completed {
                result: object.get("result").filter(|v| !v.is_null()).cloned(),
            },
            RUN_FAILED => Self::Failed {
                error: text_field(object, "error").or_else(|| text_field(object, "message")),
                error_type: text_field(object, "errorType"),
            },
            RUN_CANCELLED => Self::Cancelled {
                message: text_field(object, "message").or_else(|| text_field(object, "error")),
            },
            RUN_PAUSED => Self::Paused {
                message: text_field(object, "message"),
            },
            RUN_RESUMED => Self::Resumed {
                message: text_field(object, "message"),
            },
            other => Self::Other {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::Started => RUN_STARTED,
            Self::Completed { .. } => RUN_COMPLETED,
            Self::Failed { .. } => RUN_FAILED,
            Self::Cancelled { .. } => RUN_CANCELLED,
            Self::Paused { .. } => RUN_PAUSED,
            Self::Resumed { .. } => RUN_RESUMED,
            Self::Other { event_type } => event_type,
        }
    }

    /// JSON payload for an event the proxy manufactures itself.
    pub fn to_synthetic_value(&self, run_id: &str, timestamp: &str) -> Value {
        let mut payload = Map::new();
        payload.insert("type".to_string(), json!(self.event_type()));
        payload.insert("runId".to_string(), json!(run_id));
        payload.insert("timestamp".to_string(), json!(timestamp));
        payload.insert("synthetic".to_string(), Value::Bool(true));

        match self {
            Self::Completed {
                result: Some(result),
            } => {
                payload.insert("result".to_string(), result.clone());
            }
            Self::Failed { error, error_type } => {
                if let Some(error) = error {
                    payload.insert("error".to_string(), json!(error));
                }
                if let Some(error_type) = error_type {
                    payload.insert("errorType".to_string(), json!(error_type));
                }
            }
            Self::Cancelled {
                message: Some(message),
            }
            | Self::Paused {
                message: Some(message),
            }
            | Self::Resumed {
                message: Some(message),
            } => {
                payload.insert("message".to_string(), json!(message));
            }
            _ => {}
        }
        Value::Object(payload)
    }
}

/// Accepts plain strings, or objects carrying a string `message`.
fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Object(inner) => inner
            .get("message")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    Utf8,
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame payload is not a JSON object")]
    NotAnObject,
    #[error("frame payload has no `type` field")]
    MissingType,
}

/// One decoded frame: the interpreted event plus the raw payload for the log.
#[derive(Debug, Clone)]
pub struct FramedEvent {
    pub event: RunEvent,
    pub timestamp: Option<String>,
    pub prompt_strategy: Option<String>,
    pub raw: Value,
}

impl FramedEvent {
    pub fn parse(data: &str) -> Result<Self, FrameError> {
        let raw: Value = serde_json::from_str(data)?;
        let event = RunEvent::from_value(&raw)?;
        let timestamp = raw
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string);
        let prompt_strategy = raw
            .get("promptStrategy")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Ok(Self {
            event,
            timestamp,
            prompt_strategy,
            raw,
        })
    }
}

/// Incremental decoder; partial frames stay buffered across chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<FramedEvent, FrameError>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, delimiter_len)) = find_frame_boundary(&self.buffer) {
            let block = self.buffer.drain(..end + delimiter_len).collect::<Vec<_>>();
            if let Some(frame) = parse_block(&block[..end]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Parses whatever is left once the upstream has ended.
    pub fn finish(&mut self) -> Vec<Result<FramedEvent, FrameError>> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }
        parse_block(&rest).into_iter().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn find_frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2));
    let crlf = buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}

fn parse_block(block: &[u8]) -> Option<Result<FramedEvent, FrameError>> {
    let text = match std::str::from_utf8(block) {
        Ok(text) => text,
        Err(_) => return Some(Err(FrameError::Utf8)),
    };

    let data = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect::<Vec<_>>()
        .join("\n");

    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return None;
    }
    Some(FramedEvent::parse(&data))
}

pub fn encode_frame(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}
