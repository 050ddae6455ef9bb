use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox_run_error::{ErrorType, ProblemDetails, RunError};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::orchestrator::{RunOrchestrator, RunOutcome, StartRunRequest};
use crate::record::{RunRecord, RunStatus};

pub const RUN_ID_HEADER: &str = "x-sandbox-run-id";

#[derive(Clone)]
pub struct AppState {
    orchestrator: RunOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/runs", post(start_run))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared);

    let mut router = Router::new().nest("/v1", v1_router);

    let http_logging = match std::env::var("SANDBOX_RUN_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, start_run, get_run, cancel_run, get_openapi),
    components(
        schemas(
            HealthResponse,
            StartRunRequest,
            CancelRunRequest,
            RunResponse,
            RunErrorResponse,
            RunRecord,
            RunStatus,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "runs", description = "Sandbox run lifecycle")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Run(#[from] RunError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Run(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_runs: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CancelRunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunResponse {
    pub run: RunRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunErrorResponse {
    pub error: String,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_runs: state.orchestrator.registry().len(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/runs",
    request_body = StartRunRequest,
    responses(
        (status = 200, description = "SSE event stream when the worker streams, otherwise the finished run", body = RunResponse),
        (status = 400, body = ProblemDetails),
        (status = 500, body = RunErrorResponse)
    ),
    tag = "runs"
)]
async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRunRequest>,
) -> Result<Response, ApiError> {
    let outcome = state.orchestrator.start_run(request).await?;
    let response = match outcome {
        RunOutcome::Finished(record) => {
            let run_id = record.run_id.clone();
            let response = (StatusCode::OK, Json(RunResponse { run: record })).into_response();
            with_run_id(response, &run_id)
        }
        RunOutcome::Failed { record, error } => with_run_id(
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RunErrorResponse { error }),
            )
                .into_response(),
            &record.run_id,
        ),
        RunOutcome::Streaming(stream) => {
            let mut response = Body::from_stream(stream.body).into_response();
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            with_run_id(response, &stream.run_id)
        }
    };
    Ok(response)
}

fn with_run_id(mut response: Response, run_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(run_id) {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
    response
}

#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}",
    params(("run_id" = String, Path, description = "Run id")),
    responses(
        (status = 200, body = RunResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.orchestrator.get_run(&run_id).await?;
    Ok(Json(RunResponse { run }))
}

#[utoipa::path(
    post,
    path = "/v1/runs/{run_id}/cancel",
    params(("run_id" = String, Path, description = "Run id")),
    request_body = CancelRunRequest,
    responses(
        (status = 200, body = RunResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    request: Option<Json<CancelRunRequest>>,
) -> Result<Json<RunResponse>, ApiError> {
    let message = request.and_then(|Json(request)| request.message);
    let run = state.orchestrator.cancel_run(&run_id, message).await?;
    Ok(Json(RunResponse { run }))
}

#[utoipa::path(
    get,
    path = "/v1/openapi.json",
    responses((status = 200, description = "OpenAPI document")),
    tag = "meta"
)]
async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
