//! Run record shape, status lifecycle and the bounded event log.

use sandbox_run_error::RunError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

pub const DEFAULT_MAX_EVENTS: usize = 200;
pub const DEFAULT_MAX_ERROR_LENGTH: usize = 2000;

/// Lifecycle status of a run.
///
/// Moves forward only, except for the `Running` <-> `Paused` cycle. Once a
/// terminal status is reached the record is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable parameters a run is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub installation_id: u64,
    pub repo: String,
    pub task: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_strategy: Option<String>,
    #[serde(default)]
    pub should_commit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub installation_id: u64,
    pub repo: String,
    pub task: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_strategy: Option<String>,
    pub should_commit: bool,
    pub status: RunStatus,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid run record: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("run record field `{field}` must not be empty")]
    EmptyField { field: &'static str },
    #[error("run record field `{field}` is not an RFC 3339 timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
}

impl From<RecordError> for RunError {
    fn from(value: RecordError) -> Self {
        RunError::Persistence {
            message: value.to_string(),
        }
    }
}

impl RunRecord {
    /// Fresh `queued` record for a new run.
    pub fn queued(run_id: String, params: RunParams, now: String) -> Self {
        Self {
            run_id,
            installation_id: params.installation_id,
            repo: params.repo,
            task: params.task,
            model: params.model,
            prompt_strategy: params.prompt_strategy,
            should_commit: params.should_commit,
            status: RunStatus::Queued,
            started_at: now.clone(),
            updated_at: now,
            completed_at: None,
            error: None,
            result: None,
            events: Vec::new(),
            cancel_requested_at: None,
            cancellation_reason: None,
            paused_at: None,
            resumed_at: None,
            pause_reason: None,
            resume_reason: None,
        }
    }

    /// Parses and checks a raw stored document.
    ///
    /// Optional fields may be absent or `null`; required strings must be
    /// non-empty and timestamps must be RFC 3339.
    pub fn validate(raw: &Value) -> Result<Self, RecordError> {
        let record: RunRecord = serde_json::from_value(raw.clone())?;

        for (field, value) in [
            ("runId", &record.run_id),
            ("repo", &record.repo),
            ("task", &record.task),
            ("model", &record.model),
        ] {
            if value.trim().is_empty() {
                return Err(RecordError::EmptyField { field });
            }
        }

        check_timestamp("startedAt", &record.started_at)?;
        check_timestamp("updatedAt", &record.updated_at)?;
        if let Some(completed_at) = record.completed_at.as_deref() {
            check_timestamp("completedAt", completed_at)?;
        }

        Ok(record)
    }

    pub fn serialize(&self) -> Result<Value, RecordError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn check_timestamp(field: &'static str, value: &str) -> Result<(), RecordError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|_| ())
        .map_err(|_| RecordError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Appends `event`, evicting from the front so at most `max` entries remain.
pub fn append_event(events: &mut Vec<Value>, event: Value, max: usize) {
    events.push(event);
    if events.len() > max {
        let excess = events.len() - max;
        events.drain(..excess);
    }
}

/// Caps a failure message at `max` characters.
pub fn truncate_error(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Uses `candidate` when it is a valid RFC 3339 timestamp, otherwise now.
pub fn timestamp_or_now(candidate: Option<&str>) -> String {
    match candidate {
        Some(value) if OffsetDateTime::parse(value, &Rfc3339).is_ok() => value.to_string(),
        _ => now_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_record() -> Value {
        json!({
            "runId": "run-1",
            "installationId": 42,
            "repo": "acme/widgets",
            "task": "fix the flaky test",
            "model": "default",
            "shouldCommit": true,
            "status": "running",
            "startedAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T10:00:05.250Z",
            "events": []
        })
    }

    #[test]
    fn validate_accepts_minimal_record() {
        let record = RunRecord::validate(&raw_record()).expect("valid record");
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.installation_id, 42);
        assert!(record.completed_at.is_none());
        assert!(record.should_commit);
    }

    #[test]
    fn validate_treats_null_optionals_as_absent() {
        let mut raw = raw_record();
        raw["error"] = Value::Null;
        raw["promptStrategy"] = Value::Null;
        let record = RunRecord::validate(&raw).expect("valid record");
        assert!(record.error.is_none());
        assert!(record.prompt_strategy.is_none());
    }

    #[test]
    fn validate_rejects_bad_records() {
        let mut missing = raw_record();
        missing.as_object_mut().expect("object").remove("repo");
        assert!(matches!(
            RunRecord::validate(&missing),
            Err(RecordError::Shape(_))
        ));

        let mut status = raw_record();
        status["status"] = json!("exploded");
        assert!(RunRecord::validate(&status).is_err());

        let mut fractional = raw_record();
        fractional["installationId"] = json!(4.5);
        assert!(RunRecord::validate(&fractional).is_err());

        let mut negative = raw_record();
        negative["installationId"] = json!(-1);
        assert!(RunRecord::validate(&negative).is_err());

        let mut empty = raw_record();
        empty["task"] = json!("  ");
        assert!(matches!(
            RunRecord::validate(&empty),
            Err(RecordError::EmptyField { field: "task" })
        ));

        let mut timestamp = raw_record();
        timestamp["startedAt"] = json!("yesterday");
        assert!(matches!(
            RunRecord::validate(&timestamp),
            Err(RecordError::InvalidTimestamp { field: "startedAt", .. })
        ));
    }

    #[test]
    fn serialize_omits_absent_optionals() {
        let record = RunRecord::queued(
            "run-2".to_string(),
            RunParams {
                installation_id: 7,
                repo: "acme/widgets".to_string(),
                task: "lint".to_string(),
                model: "default".to_string(),
                prompt_strategy: None,
                should_commit: false,
            },
            now_timestamp(),
        );
        let raw = record.serialize().expect("serialize");
        assert_eq!(raw["status"], "queued");
        assert_eq!(raw["runId"], "run-2");
        assert!(raw.get("completedAt").is_none());
        assert!(raw.get("error").is_none());
        assert_eq!(RunRecord::validate(&raw).expect("reparse"), record);
    }

    #[test]
    fn append_event_keeps_latest_entries() {
        let mut events = Vec::new();
        for index in 0..25 {
            append_event(&mut events, json!({ "seq": index }), 10);
            assert!(events.len() <= 10);
        }
        let seqs: Vec<i64> = events
            .iter()
            .map(|event| event["seq"].as_i64().expect("seq"))
            .collect();
        assert_eq!(seqs, (15..25).collect::<Vec<_>>());
    }

    #[test]
    fn append_event_with_zero_capacity_stores_nothing() {
        let mut events = Vec::new();
        append_event(&mut events, json!({ "seq": 1 }), 0);
        assert!(events.is_empty());
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        assert_eq!(truncate_error("short", 10), "short");
        assert_eq!(truncate_error("abcdef", 3), "abc");
        assert_eq!(truncate_error("ééééé", 2), "éé");
    }

    #[test]
    fn event_timestamps_fall_back_to_now() {
        assert_eq!(
            timestamp_or_now(Some("2024-05-01T10:00:00Z")),
            "2024-05-01T10:00:00Z"
        );
        let fallback = timestamp_or_now(Some("later"));
        assert!(OffsetDateTime::parse(&fallback, &Rfc3339).is_ok());
        assert!(OffsetDateTime::parse(&timestamp_or_now(None), &Rfc3339).is_ok());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }
}
