use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    RunNotFound,
    ModelResolution,
    Persistence,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:sandbox-run:error:invalid_request",
            Self::RunNotFound => "urn:sandbox-run:error:run_not_found",
            Self::ModelResolution => "urn:sandbox-run:error:model_resolution",
            Self::Persistence => "urn:sandbox-run:error:persistence",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::RunNotFound => "Run Not Found",
            Self::ModelResolution => "Model Resolution Failed",
            Self::Persistence => "Persistence Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::RunNotFound => 404,
            Self::ModelResolution => 400,
            Self::Persistence => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
    #[error("model resolution failed: {message}")]
    ModelResolution { message: String },
    #[error("persistence error: {message}")]
    Persistence { message: String },
}

impl RunError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::RunNotFound { .. } => ErrorType::RunNotFound,
            Self::ModelResolution { .. } => ErrorType::ModelResolution,
            Self::Persistence { .. } => ErrorType::Persistence,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Self::RunNotFound { run_id } = self {
            map.insert("runId".to_string(), Value::String(run_id.clone()));
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<RunError> for ProblemDetails {
    fn from(value: RunError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RunError> for ProblemDetails {
    fn from(value: &RunError) -> Self {
        value.to_problem_details()
    }
}
