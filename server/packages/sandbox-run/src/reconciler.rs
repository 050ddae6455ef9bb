//! Detects cancellations persisted by another request while a run was in flight.

use std::sync::Arc;

use crate::record::{RunRecord, RunStatus};
use crate::store::RunStore;

#[derive(Clone)]
pub struct RunReconciler {
    store: Arc<dyn RunStore>,
}

impl RunReconciler {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Returns the persisted record if and only if it is `cancelled`.
    ///
    /// Read and validation failures are logged and treated as no override, so
    /// finalization always proceeds with the locally derived state.
    pub async fn persisted_terminal_override(&self, record_id: &str) -> Option<RunRecord> {
        let document = match self.store.get_by_id(record_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::warn!(record_id, "reconciler: run record missing");
                return None;
            }
            Err(err) => {
                tracing::warn!(record_id, error = %err, "reconciler: failed to read run record");
                return None;
            }
        };

        match RunRecord::validate(&document.data) {
            Ok(record) if record.status == RunStatus::Cancelled => {
                tracing::info!(
                    record_id,
                    run_id = %record.run_id,
                    "reconciler: persisted cancellation overrides local state"
                );
                Some(record)
            }
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(record_id, error = %err, "reconciler: stored run record is invalid");
                None
            }
        }
    }
}

/// Adopts a persisted cancellation on top of a locally computed record.
pub fn apply_override(record: &mut RunRecord, persisted: &RunRecord) {
    record.status = RunStatus::Cancelled;
    record.completed_at = persisted.completed_at.clone().or(record.completed_at.take());
    record.cancellation_reason = persisted.cancellation_reason.clone();
    record.cancel_requested_at = persisted.cancel_requested_at.clone();
    record.error = None;
}
