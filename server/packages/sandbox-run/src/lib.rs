//! Sandbox run lifecycle core: starts runs on an external worker, relays their
//! event streams and records exactly one terminal state per run.

pub mod cli;
pub mod events;
pub mod orchestrator;
pub mod proxy;
pub mod reconciler;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod store;
pub mod worker;

pub use orchestrator::{RunConfig, RunOrchestrator, RunOutcome, StartRunRequest};
pub use proxy::RunStream;
pub use record::{RunRecord, RunStatus};
pub use registry::{AbortHandle, AbortKind, AbortReason, AbortSignal, RunRegistry};
