//! Process-local registry of abort handles for in-flight runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

static HANDLE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub const DEFAULT_CANCEL_MESSAGE: &str = "Run cancelled";
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Run timed out";
pub const DEFAULT_SYSTEM_MESSAGE: &str = "Run aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AbortKind {
    Cancelled,
    Timeout,
    System,
}

impl AbortKind {
    fn default_message(self) -> &'static str {
        match self {
            Self::Cancelled => DEFAULT_CANCEL_MESSAGE,
            Self::Timeout => DEFAULT_TIMEOUT_MESSAGE,
            Self::System => DEFAULT_SYSTEM_MESSAGE,
        }
    }
}

/// Why a run's signal fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AbortReason {
    #[serde(rename = "type")]
    pub kind: AbortKind,
    pub message: String,
}

impl AbortReason {
    pub fn new(kind: AbortKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(AbortKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AbortKind::Timeout, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(AbortKind::System, message)
    }

    fn normalized(self) -> Self {
        let message = self.message.trim();
        if message.is_empty() {
            Self::new(self.kind, self.kind.default_message())
        } else {
            Self::new(self.kind, message)
        }
    }
}

#[derive(Debug)]
struct HandleInner {
    id: u64,
    token: CancellationToken,
    reason: Mutex<Option<AbortReason>>,
}

/// Cancellation primitive for one run, plus the reason it fired with.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    inner: Arc<HandleInner>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: HANDLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                token: CancellationToken::new(),
                reason: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: self.inner.clone(),
        }
    }

    /// Fires the signal. Only the first abort records its reason.
    pub fn abort(&self, reason: Option<AbortReason>) {
        let mut guard = lock(&self.inner.reason);
        if self.inner.token.is_cancelled() {
            return;
        }
        *guard = reason;
        self.inner.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Aborts with `reason` once `after` elapses, unless the handle fires
    /// first or the returned timer is dropped.
    pub fn abort_after(&self, after: Duration, reason: AbortReason) -> AbortTimer {
        let handle = self.clone();
        let reason = reason.normalized();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = handle.inner.token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    tracing::info!(
                        handle = handle.id(),
                        after_ms = after.as_millis() as u64,
                        "run_registry: abort timer elapsed"
                    );
                    handle.abort(Some(reason));
                }
            }
        });
        AbortTimer { task }
    }
}

#[derive(Debug)]
pub struct AbortTimer {
    task: JoinHandle<()>,
}

impl Drop for AbortTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Read side of an [`AbortHandle`], handed to the worker and the stream proxy.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    inner: Arc<HandleInner>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub async fn aborted(&self) {
        self.inner.token.cancelled().await
    }

    fn raw_reason(&self) -> Option<AbortReason> {
        lock(&self.inner.reason).clone()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    handles: Mutex<HashMap<String, AbortHandle>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    inner: Arc<RegistryInner>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle` as the live handle for `run_id`, superseding any older one.
    pub fn register(&self, run_id: &str, handle: AbortHandle) -> Registration {
        let handle_id = handle.id();
        let previous = lock(&self.inner.handles).insert(run_id.to_string(), handle);
        if let Some(previous) = previous {
            tracing::debug!(
                run_id = run_id,
                previous_handle = previous.id(),
                handle = handle_id,
                "run_registry: superseded existing handle"
            );
        }
        Registration {
            registry: self.clone(),
            run_id: run_id.to_string(),
            handle_id,
            released: false,
        }
    }

    /// Fires the live handle for `run_id`. Returns whether one was found.
    pub fn abort(&self, run_id: &str, reason: Option<AbortReason>) -> bool {
        let handle = lock(&self.inner.handles).get(run_id).cloned();
        let Some(handle) = handle else {
            tracing::debug!(run_id = run_id, "run_registry: abort for unknown run");
            return false;
        };

        let reason = reason
            .map(AbortReason::normalized)
            .unwrap_or_else(|| AbortReason::system(DEFAULT_SYSTEM_MESSAGE));
        tracing::info!(
            run_id = run_id,
            kind = ?reason.kind,
            message = %reason.message,
            "run_registry: aborting run"
        );
        handle.abort(Some(reason));
        true
    }

    pub fn cancel(&self, run_id: &str) -> bool {
        self.abort(run_id, Some(AbortReason::cancelled(DEFAULT_CANCEL_MESSAGE)))
    }

    /// Reason attached to a fired signal; `None` while it has not fired.
    pub fn reason_of(signal: &AbortSignal) -> Option<AbortReason> {
        if !signal.is_aborted() {
            return None;
        }
        Some(
            signal
                .raw_reason()
                .map(AbortReason::normalized)
                .unwrap_or_else(|| AbortReason::system(DEFAULT_SYSTEM_MESSAGE)),
        )
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        lock(&self.inner.handles).contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister_handle(&self, run_id: &str, handle_id: u64) -> bool {
        let mut handles = lock(&self.inner.handles);
        match handles.get(run_id) {
            Some(current) if current.id() == handle_id => {
                handles.remove(run_id);
                true
            }
            _ => false,
        }
    }
}

/// Ties a registry entry to one handle. Dropping it unregisters that handle,
/// leaving any newer registration for the same run untouched.
#[derive(Debug)]
pub struct Registration {
    registry: RunRegistry,
    run_id: String,
    handle_id: u64,
    released: bool,
}

impl Registration {
    /// Returns whether the registry entry still belonged to this handle.
    pub fn unregister(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.registry.unregister_handle(&self.run_id, self.handle_id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
