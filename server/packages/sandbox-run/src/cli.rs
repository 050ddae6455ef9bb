use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::orchestrator::{RunConfig, RunOrchestrator};
use crate::resolver::StaticModelResolver;
use crate::router::{build_router, ApiDoc, AppState, RUN_ID_HEADER};
use crate::store::{FileRunStore, MemoryRunStore, RunStore, StoreError};
use crate::worker::{HttpWorker, WorkerError};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;

#[derive(Parser, Debug)]
#[command(name = "sandbox-run", bin_name = "sandbox-run")]
#[command(about = "Start, stream and cancel sandbox runs", version)]
#[command(arg_required_else_help = true)]
pub struct SandboxRunCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sandbox run HTTP server.
    Server(ServerArgs),
    /// Print the OpenAPI document.
    Openapi(OpenapiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Endpoint the run requests are POSTed to.
    #[arg(long = "worker-url", short = 'w')]
    worker_url: String,

    #[arg(long = "worker-token")]
    worker_token: Option<String>,

    /// Directory for run records. Defaults to the user data directory.
    #[arg(long = "data-dir", conflicts_with = "ephemeral")]
    data_dir: Option<PathBuf>,

    /// Keep run records in memory only.
    #[arg(long)]
    ephemeral: bool,

    #[arg(long = "run-timeout-ms")]
    run_timeout_ms: Option<u64>,

    #[arg(long = "max-events")]
    max_events: Option<usize>,

    #[arg(long = "default-model")]
    default_model: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct OpenapiArgs {
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_sandbox_run() -> Result<(), CliError> {
    let cli = SandboxRunCli::parse();
    init_logging();
    run_command(&cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Openapi(args) => write_openapi(args),
    }
}

/// Environment first, then explicit flags on top.
fn run_config(server: &ServerArgs) -> RunConfig {
    let mut config = RunConfig::from_env();
    if let Some(timeout_ms) = server.run_timeout_ms.filter(|value| *value > 0) {
        config.run_timeout = Some(Duration::from_millis(timeout_ms));
    }
    if let Some(max_events) = server.max_events.filter(|value| *value > 0) {
        config.max_events = max_events;
    }
    config
}

fn build_store(server: &ServerArgs) -> Result<Arc<dyn RunStore>, CliError> {
    if server.ephemeral {
        tracing::warn!("run records are kept in memory and lost on exit");
        return Ok(Arc::new(MemoryRunStore::new()));
    }
    let dir = server
        .data_dir
        .clone()
        .unwrap_or_else(FileRunStore::default_dir);
    let store = FileRunStore::new(dir)?;
    tracing::info!(dir = %store.dir().display(), "storing run records on disk");
    Ok(Arc::new(store))
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = run_config(server);
    let store = build_store(server)?;
    let worker = HttpWorker::new(server.worker_url.clone(), server.worker_token.clone())?;
    let resolver = StaticModelResolver::new(server.default_model.clone());
    let orchestrator =
        RunOrchestrator::new(store, Arc::new(worker), Arc::new(resolver), config.clone());

    let cors = build_cors_layer(server)?;
    let router = build_router(AppState::new(orchestrator)).layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            worker_url = %server.worker_url,
            max_events = config.max_events,
            run_timeout_ms = config.run_timeout.map(|timeout| timeout.as_millis() as u64),
            "server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn write_openapi(args: &OpenapiArgs) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(&ApiDoc::openapi())?;
    match &args.out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }

    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(RUN_ID_HEADER)]))
}
