//! Run orchestrator: the entry point that creates a run, invokes the worker and
//! either finishes the run inline or hands the event stream to the proxy.

use std::sync::Arc;
use std::time::Duration;

use sandbox_run_error::RunError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::proxy::{
    apply_abort, apply_failure, persist_record, ProxyRun, RunStream, StreamProxy,
    DEFAULT_FAILURE_MESSAGE,
};
use crate::reconciler::RunReconciler;
use crate::record::{
    now_timestamp, truncate_error, RunParams, RunRecord, RunStatus, DEFAULT_MAX_ERROR_LENGTH,
    DEFAULT_MAX_EVENTS,
};
use crate::registry::{
    AbortHandle, AbortReason, Registration, RunRegistry, DEFAULT_CANCEL_MESSAGE,
    DEFAULT_SYSTEM_MESSAGE, DEFAULT_TIMEOUT_MESSAGE,
};
use crate::resolver::{ModelResolver, ResolveContext};
use crate::store::RunStore;
use crate::worker::{Worker, WorkerError, WorkerRequest};

pub const EMPTY_RESPONSE_MESSAGE: &str = "Sandbox worker returned an empty response";

const MAX_EVENTS_ENV: &str = "SANDBOX_RUN_MAX_EVENTS";
const MAX_ERROR_LENGTH_ENV: &str = "SANDBOX_RUN_MAX_ERROR_LENGTH";
const TIMEOUT_ENV: &str = "SANDBOX_RUN_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub max_events: usize,
    pub max_error_length: usize,
    pub run_timeout: Option<Duration>,
    pub owner_id: String,
    pub collection_id: String,
    pub record_type: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            max_error_length: DEFAULT_MAX_ERROR_LENGTH,
            run_timeout: None,
            owner_id: "sandbox".to_string(),
            collection_id: "sandbox-runs".to_string(),
            record_type: "sandbox_run".to_string(),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_events: usize_from_env(MAX_EVENTS_ENV, defaults.max_events),
            max_error_length: usize_from_env(MAX_ERROR_LENGTH_ENV, defaults.max_error_length),
            run_timeout: positive_from_env(TIMEOUT_ENV).map(Duration::from_millis),
            ..defaults
        }
    }
}

fn positive_from_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn usize_from_env(key: &str, default: usize) -> usize {
    positive_from_env(key)
        .and_then(|value| usize::try_from(value).ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub installation_id: u64,
    pub repo: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_strategy: Option<String>,
    #[serde(default)]
    pub should_commit: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The run ended without streaming. Cancellation lands here too.
    Finished(RunRecord),
    /// The worker could not run the task; the record is already `failed`.
    Failed { record: RunRecord, error: String },
    Streaming(RunStream),
}

#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: Arc<dyn RunStore>,
    worker: Arc<dyn Worker>,
    resolver: Arc<dyn ModelResolver>,
    registry: RunRegistry,
    reconciler: RunReconciler,
    proxy: StreamProxy,
    config: RunConfig,
}

/// Live state of a run between registration and its terminal write.
struct ActiveRun {
    record_id: String,
    record: RunRecord,
    handle: AbortHandle,
    registration: Registration,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        worker: Arc<dyn Worker>,
        resolver: Arc<dyn ModelResolver>,
        config: RunConfig,
    ) -> Self {
        Self::with_registry(store, worker, resolver, RunRegistry::new(), config)
    }

    pub fn with_registry(
        store: Arc<dyn RunStore>,
        worker: Arc<dyn Worker>,
        resolver: Arc<dyn ModelResolver>,
        registry: RunRegistry,
        config: RunConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                reconciler: RunReconciler::new(store.clone()),
                proxy: StreamProxy::new(
                    store.clone(),
                    config.max_events,
                    config.max_error_length,
                ),
                store,
                worker,
                resolver,
                registry,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.inner.registry
    }

    pub async fn start_run(&self, request: StartRunRequest) -> Result<RunOutcome, RunError> {
        let inner = &self.inner;
        if request.repo.trim().is_empty() {
            return Err(RunError::InvalidRequest {
                message: "repo must not be empty".to_string(),
            });
        }
        if request.task.trim().is_empty() {
            return Err(RunError::InvalidRequest {
                message: "task must not be empty".to_string(),
            });
        }

        let context = ResolveContext {
            installation_id: request.installation_id,
            repo: request.repo.clone(),
        };
        let model = inner
            .resolver
            .resolve(&context, request.model.as_deref())
            .await?;

        let run_id = Uuid::new_v4().to_string();
        let mut record = RunRecord::queued(
            run_id.clone(),
            RunParams {
                installation_id: request.installation_id,
                repo: request.repo,
                task: request.task,
                model,
                prompt_strategy: request.prompt_strategy,
                should_commit: request.should_commit,
            },
            now_timestamp(),
        );

        let created = inner
            .store
            .create(
                &inner.config.owner_id,
                &inner.config.collection_id,
                &run_id,
                &inner.config.record_type,
                record.serialize()?,
            )
            .await?;
        tracing::info!(
            run_id = %run_id,
            record_id = %created.id,
            repo = %record.repo,
            model = %record.model,
            "sandbox_run: run created"
        );

        record.status = RunStatus::Running;
        record.updated_at = now_timestamp();
        persist_record(inner.store.as_ref(), &created.id, &record).await;

        let handle = AbortHandle::new();
        let registration = inner.registry.register(&run_id, handle.clone());
        let timer = inner
            .config
            .run_timeout
            .map(|after| handle.abort_after(after, AbortReason::timeout(DEFAULT_TIMEOUT_MESSAGE)));

        let worker_request = WorkerRequest {
            run_id: run_id.clone(),
            installation_id: record.installation_id,
            repo: record.repo.clone(),
            task: record.task.clone(),
            model: record.model.clone(),
            prompt_strategy: record.prompt_strategy.clone(),
            should_commit: record.should_commit,
        };
        let mut run = ActiveRun {
            record_id: created.id,
            record,
            handle,
            registration,
        };

        let response = match inner.worker.invoke(worker_request, run.handle.signal()).await {
            Ok(response) => response,
            Err(err) => {
                if run.handle.is_aborted() || matches!(err, WorkerError::Aborted) {
                    return Ok(self.finish_aborted(run).await);
                }
                let message = err.to_string();
                tracing::warn!(run_id = %run_id, error = %message, "sandbox_run: worker invocation failed");
                apply_failure(&mut run.record, &message, inner.config.max_error_length);
                let record = self.finish(run).await;
                return Ok(RunOutcome::Failed {
                    record,
                    error: message,
                });
            }
        };

        if !response.is_ok() {
            let status = response.status;
            let signal = run.handle.signal();
            let body = tokio::select! {
                biased;
                _ = signal.aborted() => return Ok(self.finish_aborted(run).await),
                body = response.text() => body,
            };
            return Ok(self.finish_rejected(run, status, body).await);
        }

        if !response.has_body() {
            return Ok(self.finish_failed(run, EMPTY_RESPONSE_MESSAGE).await);
        }

        if response.is_event_stream() {
            let Some(upstream) = response.into_body() else {
                return Ok(self.finish_failed(run, EMPTY_RESPONSE_MESSAGE).await);
            };
            tracing::info!(run_id = %run_id, "sandbox_run: relaying worker event stream");
            let stream = inner.proxy.spawn(ProxyRun {
                record_id: run.record_id,
                record: run.record,
                signal: run.handle.signal(),
                registration: run.registration,
                upstream,
                timer,
            });
            return Ok(RunOutcome::Streaming(stream));
        }

        let signal = run.handle.signal();
        let payload = tokio::select! {
            biased;
            _ = signal.aborted() => return Ok(self.finish_aborted(run).await),
            payload = response.json_body() => payload,
        };
        drop(timer);

        match payload {
            Ok(payload) => Ok(self.finish_buffered(run, payload).await),
            Err(err) => Ok(self.finish_failed(run, &err.to_string()).await),
        }
    }

    /// Persists `cancelled` for a run, then fires its abort signal if it is
    /// still in flight in this process. Terminal runs are returned unchanged.
    pub async fn cancel_run(
        &self,
        run_id: &str,
        message: Option<String>,
    ) -> Result<RunRecord, RunError> {
        let inner = &self.inner;
        let document = inner
            .store
            .find_by_run_id(run_id)
            .await?
            .ok_or_else(|| RunError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let mut record = RunRecord::validate(&document.data)?;
        if record.is_terminal() {
            tracing::debug!(run_id, status = %record.status, "sandbox_run: cancel ignored for finished run");
            return Ok(record);
        }

        let reason = message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .unwrap_or(DEFAULT_CANCEL_MESSAGE)
            .to_string();
        // The proxy may have written its terminal record since the lookup.
        if let Some(current) = inner.store.get_by_id(&document.id).await? {
            let current = RunRecord::validate(&current.data)?;
            if current.is_terminal() {
                tracing::debug!(run_id, status = %current.status, "sandbox_run: run finished before cancel");
                return Ok(current);
            }
        }

        let now = now_timestamp();
        record.status = RunStatus::Cancelled;
        record.cancel_requested_at = Some(now.clone());
        record.completed_at = Some(now.clone());
        record.cancellation_reason = Some(reason.clone());
        record.error = None;
        record.updated_at = now;
        inner.store.update(&document.id, record.serialize()?).await?;

        let signalled = inner
            .registry
            .abort(run_id, Some(AbortReason::cancelled(reason)));
        tracing::info!(run_id, signalled, "sandbox_run: run cancelled");
        Ok(record)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, RunError> {
        let document = self
            .inner
            .store
            .find_by_run_id(run_id)
            .await?
            .ok_or_else(|| RunError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        Ok(RunRecord::validate(&document.data)?)
    }

    async fn finish_aborted(&self, mut run: ActiveRun) -> RunOutcome {
        if let Some(persisted) = self.persisted_cancellation(&run).await {
            run.registration.unregister();
            return RunOutcome::Finished(persisted);
        }
        let reason = RunRegistry::reason_of(&run.handle.signal())
            .unwrap_or_else(|| AbortReason::system(DEFAULT_SYSTEM_MESSAGE));
        tracing::info!(
            run_id = %run.record.run_id,
            kind = ?reason.kind,
            "sandbox_run: worker invocation aborted"
        );
        apply_abort(
            &mut run.record,
            &reason,
            self.inner.config.max_error_length,
        );
        RunOutcome::Finished(self.finish(run).await)
    }

    async fn finish_rejected(
        &self,
        run: ActiveRun,
        status: u16,
        body: Result<String, WorkerError>,
    ) -> RunOutcome {
        if let Some(persisted) = self.persisted_cancellation(&run).await {
            run.registration.unregister();
            return RunOutcome::Finished(persisted);
        }
        let body = body.unwrap_or_else(|err| err.to_string());
        let message = if body.trim().is_empty() {
            format!("Sandbox worker responded with status {status}")
        } else {
            body
        };
        tracing::warn!(run_id = %run.record.run_id, status, "sandbox_run: worker rejected run");
        self.finish_failed(run, &message).await
    }

    async fn finish_buffered(&self, mut run: ActiveRun, payload: Value) -> RunOutcome {
        if let Some(persisted) = self.persisted_cancellation(&run).await {
            run.registration.unregister();
            return RunOutcome::Finished(persisted);
        }

        let record = &mut run.record;
        record.completed_at = Some(now_timestamp());
        if payload.get("success").and_then(Value::as_bool) == Some(true) {
            record.status = RunStatus::Completed;
        } else {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .filter(|error| !error.trim().is_empty())
                .unwrap_or(DEFAULT_FAILURE_MESSAGE);
            record.status = RunStatus::Failed;
            record.error = Some(truncate_error(error, self.inner.config.max_error_length));
        }
        record.result = Some(payload);
        RunOutcome::Finished(self.finish(run).await)
    }

    async fn finish_failed(&self, mut run: ActiveRun, message: &str) -> RunOutcome {
        apply_failure(&mut run.record, message, self.inner.config.max_error_length);
        let error = run.record.error.clone().unwrap_or_default();
        let record = self.finish(run).await;
        RunOutcome::Failed { record, error }
    }

    async fn persisted_cancellation(&self, run: &ActiveRun) -> Option<RunRecord> {
        self.inner
            .reconciler
            .persisted_terminal_override(&run.record_id)
            .await
    }

    async fn finish(&self, run: ActiveRun) -> RunRecord {
        let ActiveRun {
            record_id,
            mut record,
            registration,
            ..
        } = run;
        record.updated_at = now_timestamp();
        persist_record(self.inner.store.as_ref(), &record_id, &record).await;
        registration.unregister();
        tracing::info!(
            run_id = %record.run_id,
            status = %record.status,
            "sandbox_run: run finished"
        );
        record
    }
}
