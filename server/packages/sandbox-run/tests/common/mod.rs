#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use sandbox_run::orchestrator::{RunConfig, RunOrchestrator, StartRunRequest};
use sandbox_run::registry::AbortSignal;
use sandbox_run::resolver::StaticModelResolver;
use sandbox_run::store::{
    MemoryRunStore, RunStore, StoreError, StoreFuture, StoredDocument, StoredRef,
};
use sandbox_run::worker::{
    ByteStream, Worker, WorkerError, WorkerFuture, WorkerRequest, WorkerResponse,
};
use sandbox_run::RunRecord;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

/// One scripted reply to a worker invocation.
pub enum Script {
    Json(u16, Value),
    Text(u16, String),
    Empty(u16),
    /// Event stream that yields these chunks, then ends.
    Stream(Vec<Bytes>),
    /// Event stream fed by the test through a channel.
    Channel(mpsc::Receiver<Result<Bytes, WorkerError>>),
    Fail(String),
    /// Status line with a body that never yields.
    Stalled(u16),
    /// Blocks until the run's signal fires, then reports the abort.
    WaitForAbort,
    /// Waits for the notify before producing the inner reply.
    Gated(Arc<Notify>, Box<Script>),
}

#[derive(Default)]
pub struct ScriptedWorker {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<WorkerRequest>>,
    invoked: Notify,
}

impl ScriptedWorker {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            invoked: Notify::new(),
        })
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Run id of the first invocation, once the worker has been called.
    pub async fn first_run_id(&self) -> String {
        loop {
            let notified = self.invoked.notified();
            if let Some(request) = self.requests().first() {
                return request.run_id.clone();
            }
            tokio::time::timeout(Duration::from_secs(5), notified)
                .await
                .expect("worker invoked");
        }
    }
}

impl Worker for ScriptedWorker {
    fn invoke(&self, request: WorkerRequest, signal: AbortSignal) -> WorkerFuture<'_> {
        self.requests.lock().expect("requests lock").push(request);
        self.invoked.notify_waiters();
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .expect("a scripted reply for every invocation");
        Box::pin(play(script, signal))
    }
}

async fn play(script: Script, signal: AbortSignal) -> Result<WorkerResponse, WorkerError> {
    let mut script = script;
    loop {
        return match script {
            Script::Json(status, payload) => Ok(WorkerResponse::json(status, &payload)),
            Script::Text(status, text) => Ok(WorkerResponse::text_body(status, text)),
            Script::Empty(status) => Ok(WorkerResponse::empty(status)),
            Script::Stream(chunks) => {
                let body: ByteStream = Box::pin(stream::iter(chunks.into_iter().map(Ok)));
                Ok(WorkerResponse::event_stream(body))
            }
            Script::Channel(rx) => {
                let body: ByteStream = Box::pin(ReceiverStream::new(rx));
                Ok(WorkerResponse::event_stream(body))
            }
            Script::Fail(message) => Err(WorkerError::Transport(message)),
            Script::Stalled(status) => {
                let body: ByteStream = Box::pin(stream::pending());
                Ok(WorkerResponse::new(
                    status,
                    Some("text/plain".to_string()),
                    Some(body),
                ))
            }
            Script::WaitForAbort => {
                signal.aborted().await;
                Err(WorkerError::Aborted)
            }
            Script::Gated(gate, inner) => {
                gate.notified().await;
                script = *inner;
                continue;
            }
        };
    }
}

/// Memory store that counts updates and can be told to reject them.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryRunStore,
    updates: AtomicUsize,
    fail_updates: AtomicBool,
    after_lookup: Mutex<Option<RunRecord>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Writes `record` right after the next lookup by run id returns, as a
    /// concurrent finalization would.
    pub fn write_after_lookup(&self, record: RunRecord) {
        *self.after_lookup.lock().expect("after_lookup lock") = Some(record);
    }

    pub async fn record(&self, run_id: &str) -> RunRecord {
        let document = self
            .inner
            .find_by_run_id(run_id)
            .await
            .expect("find")
            .expect("run persisted");
        RunRecord::validate(&document.data).expect("valid persisted record")
    }

    /// Writes a record as another request would, bypassing the orchestrator.
    pub async fn overwrite(&self, record: &RunRecord) {
        let document = self
            .inner
            .find_by_run_id(&record.run_id)
            .await
            .expect("find")
            .expect("run persisted");
        self.inner
            .update(&document.id, record.serialize().expect("serialize"))
            .await
            .expect("overwrite");
    }
}

impl RunStore for RecordingStore {
    fn create(
        &self,
        owner_id: &str,
        collection_id: &str,
        run_id: &str,
        record_type: &str,
        data: Value,
    ) -> StoreFuture<'_, StoredRef> {
        self.inner
            .create(owner_id, collection_id, run_id, record_type, data)
    }

    fn update(&self, id: &str, data: Value) -> StoreFuture<'_, ()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Box::pin(async { Err(StoreError::Backend("store unavailable".to_string())) });
        }
        self.inner.update(id, data)
    }

    fn get_by_id(&self, id: &str) -> StoreFuture<'_, Option<StoredDocument>> {
        self.inner.get_by_id(id)
    }

    fn find_by_run_id(&self, run_id: &str) -> StoreFuture<'_, Option<StoredDocument>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            let found = self.inner.find_by_run_id(&run_id).await?;
            let pending = self.after_lookup.lock().expect("after_lookup lock").take();
            if let (Some(document), Some(record)) = (found.as_ref(), pending) {
                let data = record
                    .serialize()
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                self.inner.update(&document.id, data).await?;
            }
            Ok(found)
        })
    }
}

pub fn orchestrator(
    store: Arc<RecordingStore>,
    worker: Arc<ScriptedWorker>,
    config: RunConfig,
) -> RunOrchestrator {
    RunOrchestrator::new(
        store,
        worker,
        Arc::new(StaticModelResolver::new(Some("default-model".to_string()))),
        config,
    )
}

pub fn start_request(should_commit: bool) -> StartRunRequest {
    StartRunRequest {
        installation_id: 42,
        repo: "acme/widgets".to_string(),
        task: "fix the flaky test".to_string(),
        model: None,
        prompt_strategy: None,
        should_commit,
    }
}

pub fn frame(payload: Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

pub async fn read_body<S>(body: S) -> String
where
    S: futures::Stream<Item = Result<Bytes, std::convert::Infallible>> + Unpin,
{
    let chunks: Vec<_> = tokio::time::timeout(Duration::from_secs(5), body.collect::<Vec<_>>())
        .await
        .expect("stream finished");
    let mut out = Vec::new();
    for chunk in chunks {
        match chunk {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(never) => match never {},
        }
    }
    String::from_utf8(out).expect("utf8 body")
}

/// Data payloads of every `data:` frame in an SSE body.
pub fn frames(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|block| {
            let data = block
                .lines()
                .filter_map(|line| line.strip_prefix("data: "))
                .collect::<Vec<_>>()
                .join("\n");
            serde_json::from_str(&data).ok()
        })
        .collect()
}
