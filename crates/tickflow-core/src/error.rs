//! Engine-level errors.

use thiserror::Error;
use tickflow_types::error::{JsonError, QueueError, StoreError};
use uuid::Uuid;

/// Errors surfaced by the engine's own operations (as opposed to workflow
/// failures, which travel as [`JsonError`] values inside run results).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run failed: {0}")]
    RunFailed(JsonError),

    #[error("internal engine error: {0}")]
    Internal(String),
}
