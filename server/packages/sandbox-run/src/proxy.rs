//! Stream proxy: relays a worker's SSE body to the caller while tracking run
//! state, then writes the terminal record exactly once.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::{
    encode_frame, FrameError, FramedEvent, RunEvent, SseDecoder, TIMEOUT_ERROR_TYPE,
};
use crate::reconciler::{apply_override, RunReconciler};
use crate::record::{
    append_event, now_timestamp, timestamp_or_now, truncate_error, RunRecord, RunStatus,
};
use crate::registry::{
    AbortKind, AbortReason, AbortSignal, AbortTimer, Registration, RunRegistry,
    DEFAULT_CANCEL_MESSAGE,
};
use crate::store::RunStore;
use crate::worker::ByteStream;

pub const STREAM_ENDED_MESSAGE: &str = "Sandbox stream ended without a final status";
pub const DEFAULT_FAILURE_MESSAGE: &str = "Sandbox run failed";

const DOWNSTREAM_CHANNEL_SIZE: usize = 64;
/// How long the synthetic terminal frame may wait for a stalled client.
const FINAL_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

pub type DownstreamBody = ReceiverStream<Result<Bytes, Infallible>>;

/// A run whose events are being relayed to the caller.
#[derive(Debug)]
pub struct RunStream {
    pub run_id: String,
    /// Upstream bytes verbatim, followed by any synthetic terminal frame.
    pub body: DownstreamBody,
    /// Resolves to the record as it was finally persisted.
    pub completion: JoinHandle<RunRecord>,
}

/// Everything the proxy takes ownership of for one run.
pub struct ProxyRun {
    pub record_id: String,
    pub record: RunRecord,
    pub signal: AbortSignal,
    pub registration: Registration,
    pub upstream: ByteStream,
    /// Run timeout, cancelled once the run is finalized.
    pub timer: Option<AbortTimer>,
}

#[derive(Clone)]
pub struct StreamProxy {
    store: Arc<dyn RunStore>,
    reconciler: RunReconciler,
    max_events: usize,
    max_error_length: usize,
}

enum LoopExit {
    Ended,
    Aborted,
    ReadError(String),
}

impl StreamProxy {
    pub fn new(store: Arc<dyn RunStore>, max_events: usize, max_error_length: usize) -> Self {
        Self {
            reconciler: RunReconciler::new(store.clone()),
            store,
            max_events,
            max_error_length,
        }
    }

    pub fn spawn(&self, run: ProxyRun) -> RunStream {
        let (tx, rx) = mpsc::channel(DOWNSTREAM_CHANNEL_SIZE);
        let run_id = run.record.run_id.clone();
        let proxy = self.clone();
        let completion = tokio::spawn(async move { proxy.drive(run, tx).await });
        RunStream {
            run_id,
            body: ReceiverStream::new(rx),
            completion,
        }
    }

    async fn drive(
        self,
        run: ProxyRun,
        tx: mpsc::Sender<Result<Bytes, Infallible>>,
    ) -> RunRecord {
        let ProxyRun {
            record_id,
            mut record,
            signal,
            registration,
            mut upstream,
            timer,
        } = run;
        record.status = RunStatus::Running;

        let mut downstream = Downstream {
            tx,
            connected: true,
            run_id: record.run_id.clone(),
        };
        let mut decoder = SseDecoder::new();

        let exit = loop {
            tokio::select! {
                biased;
                _ = signal.aborted() => break LoopExit::Aborted,
                chunk = upstream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        tracing::debug!(run_id = %record.run_id, len = bytes.len(), "stream_proxy: chunk");
                        let frames = decoder.push(&bytes);
                        let delivered = downstream.send(bytes, &signal).await;
                        for frame in frames {
                            self.handle_frame(&mut record, frame);
                        }
                        if !delivered {
                            break LoopExit::Aborted;
                        }
                    }
                    Some(Err(err)) => break LoopExit::ReadError(err.to_string()),
                    None => break LoopExit::Ended,
                },
            }
        };

        if matches!(exit, LoopExit::Ended) && decoder.has_pending() {
            for frame in decoder.finish() {
                self.handle_frame(&mut record, frame);
            }
        }
        drop(upstream);
        drop(timer);

        if !record.is_terminal() {
            let synthetic = match (RunRegistry::reason_of(&signal), exit) {
                (Some(reason), _) => apply_abort(&mut record, &reason, self.max_error_length),
                (None, LoopExit::ReadError(message)) => {
                    tracing::warn!(run_id = %record.run_id, error = %message, "stream_proxy: upstream read failed");
                    apply_failure(&mut record, &message, self.max_error_length)
                }
                (None, _) => {
                    tracing::warn!(run_id = %record.run_id, "stream_proxy: stream ended without a terminal event");
                    apply_failure(&mut record, STREAM_ENDED_MESSAGE, self.max_error_length)
                }
            };
            let payload = synthetic.to_synthetic_value(&record.run_id, &now_timestamp());
            append_event(&mut record.events, payload.clone(), self.max_events);
            downstream.send_final(encode_frame(&payload)).await;
        }

        if let Some(persisted) = self.reconciler.persisted_terminal_override(&record_id).await {
            apply_override(&mut record, &persisted);
        }

        record.updated_at = now_timestamp();
        persist_record(self.store.as_ref(), &record_id, &record).await;

        registration.unregister();
        drop(downstream);

        tracing::info!(
            run_id = %record.run_id,
            status = %record.status,
            "stream_proxy: run finalized"
        );
        record
    }

    fn handle_frame(&self, record: &mut RunRecord, frame: Result<FramedEvent, FrameError>) {
        match frame {
            Ok(frame) => apply_event(record, frame, self.max_events, self.max_error_length),
            Err(err) => {
                tracing::warn!(run_id = %record.run_id, error = %err, "stream_proxy: skipping malformed frame");
            }
        }
    }
}

struct Downstream {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    connected: bool,
    run_id: String,
}

impl Downstream {
    /// Relays best-effort; a gone client never stops the upstream drain.
    ///
    /// Waiting on a full channel is raced against `signal`. Returns `false`
    /// when the signal fired before the chunk could be handed over.
    async fn send(&mut self, bytes: Bytes, signal: &AbortSignal) -> bool {
        if !self.connected {
            return true;
        }
        let sent = tokio::select! {
            biased;
            _ = signal.aborted() => {
                tracing::info!(run_id = %self.run_id, "stream_proxy: abort while client was not reading");
                return false;
            }
            sent = self.tx.send(Ok(bytes)) => sent,
        };
        if sent.is_err() {
            self.disconnected();
        }
        true
    }

    /// Hands over the last frame, giving up on a client that stopped reading.
    async fn send_final(&mut self, bytes: Bytes) {
        if !self.connected {
            return;
        }
        match tokio::time::timeout(FINAL_FRAME_TIMEOUT, self.tx.send(Ok(bytes))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => self.disconnected(),
            Err(_) => {
                tracing::warn!(run_id = %self.run_id, "stream_proxy: client stalled, dropping terminal frame");
            }
        }
    }

    fn disconnected(&mut self) {
        self.connected = false;
        tracing::info!(run_id = %self.run_id, "stream_proxy: client disconnected, draining upstream");
    }
}

/// Logs the event and applies its lifecycle effect.
pub(crate) fn apply_event(
    record: &mut RunRecord,
    frame: FramedEvent,
    max_events: usize,
    max_error_length: usize,
) {
    let FramedEvent {
        event,
        timestamp,
        prompt_strategy,
        raw,
    } = frame;
    append_event(&mut record.events, raw, max_events);
    if let Some(prompt_strategy) = prompt_strategy {
        record.prompt_strategy = Some(prompt_strategy);
    }

    if record.is_terminal() {
        if !matches!(event, RunEvent::Other { .. }) {
            tracing::debug!(
                run_id = %record.run_id,
                event_type = event.event_type(),
                status = %record.status,
                "stream_proxy: ignoring lifecycle event after terminal status"
            );
        }
        return;
    }

    let at = timestamp_or_now(timestamp.as_deref());
    match event {
        RunEvent::Started => {
            record.status = RunStatus::Running;
        }
        RunEvent::Completed { result } => {
            record.status = RunStatus::Completed;
            record.completed_at = Some(at);
            if result.is_some() {
                record.result = result;
            }
        }
        RunEvent::Failed { error, .. } => {
            record.status = RunStatus::Failed;
            record.completed_at = Some(at);
            record.error = Some(truncate_error(
                error.as_deref().unwrap_or(DEFAULT_FAILURE_MESSAGE),
                max_error_length,
            ));
        }
        RunEvent::Cancelled { message } => {
            record.status = RunStatus::Cancelled;
            record.completed_at = Some(at);
            record.cancellation_reason =
                Some(message.unwrap_or_else(|| DEFAULT_CANCEL_MESSAGE.to_string()));
            record.error = None;
        }
        RunEvent::Paused { message } => {
            record.status = RunStatus::Paused;
            record.paused_at = Some(at);
            record.pause_reason = message;
        }
        RunEvent::Resumed { message } => {
            record.status = RunStatus::Running;
            record.resumed_at = Some(at);
            record.resume_reason = message;
        }
        RunEvent::Other { event_type } => {
            tracing::debug!(run_id = %record.run_id, event_type = %event_type, "stream_proxy: progress event");
        }
    }
}

/// Terminal transition for a fired abort signal. Returns the synthetic event
/// describing it.
pub(crate) fn apply_abort(
    record: &mut RunRecord,
    reason: &AbortReason,
    max_error_length: usize,
) -> RunEvent {
    let now = now_timestamp();
    record.completed_at = Some(now.clone());
    match reason.kind {
        AbortKind::Timeout => {
            let message = truncate_error(&reason.message, max_error_length);
            record.status = RunStatus::Failed;
            record.error = Some(message.clone());
            record.cancellation_reason = None;
            RunEvent::Failed {
                error: Some(message),
                error_type: Some(TIMEOUT_ERROR_TYPE.to_string()),
            }
        }
        AbortKind::Cancelled | AbortKind::System => {
            record.status = RunStatus::Cancelled;
            record.error = None;
            record.cancellation_reason = Some(reason.message.clone());
            record.cancel_requested_at.get_or_insert(now);
            RunEvent::Cancelled {
                message: Some(reason.message.clone()),
            }
        }
    }
}

pub(crate) fn apply_failure(
    record: &mut RunRecord,
    message: &str,
    max_error_length: usize,
) -> RunEvent {
    let message = truncate_error(message, max_error_length);
    record.status = RunStatus::Failed;
    record.completed_at = Some(now_timestamp());
    record.error = Some(message.clone());
    RunEvent::Failed {
        error: Some(message),
        error_type: None,
    }
}

/// Writes the record; failures are logged and not retried.
pub(crate) async fn persist_record(store: &dyn RunStore, record_id: &str, record: &RunRecord) {
    let data = match record.serialize() {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(run_id = %record.run_id, record_id, error = %err, "run: failed to serialize run record");
            return;
        }
    };
    if let Err(err) = store.update(record_id, data).await {
        tracing::error!(
            run_id = %record.run_id,
            record_id,
            status = %record.status,
            error = %err,
            "run: failed to persist run record"
        );
    }
}
