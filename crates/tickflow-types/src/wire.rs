//! Checkpoint wire protocol.
//!
//! A remote runner can drive a single discovery pass over HTTP-shaped
//! payloads: it sends the memoized step results it already holds plus one
//! null-valued step marking the op it wants executed, and receives either the
//! workflow result or the list of newly discovered ops.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JsonError;

/// Execution context echoed by the caller on every checkpoint request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointCtx {
    /// Attempt number the caller believes it is on (1-based).
    pub attempt: u32,
    /// The run being driven; `None` on the very first request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

/// A memoized step result carried by the caller.
///
/// Untagged: a seed is either `{"data": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSeed {
    Data { data: Value },
    Error { error: JsonError },
}

/// One checkpoint request: seeds plus at most one execution target.
///
/// Keys of `steps` are hashed op ids. A `None` value marks the single op the
/// caller wants executed during this pass; `Some` values seed the memo table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub ctx: CheckpointCtx,
    /// Workflow input; only consulted when the request creates the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default)]
    pub steps: BTreeMap<String, Option<StepSeed>>,
}

impl CheckpointRequest {
    /// The single null-valued step, if any: the op this pass should execute.
    pub fn target(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|(_, seed)| seed.is_none())
            .map(|(hashed, _)| hashed.as_str())
    }
}

/// An op surfaced to the caller by a discovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredOp {
    /// Hashed op id; the caller uses it as a `steps` key on the next request.
    pub id: String,
    /// Kind label ("run", "sleep", ...).
    pub op: String,
    /// Human-assigned op id.
    pub name: String,
    /// Kind-specific detail (sleep deadline, signal name, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outcome of one checkpoint pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointResponse {
    /// The workflow finished; `output` is its result.
    Complete { run_id: Uuid, output: Value },
    /// The workflow failed terminally.
    Failed { run_id: Uuid, error: JsonError },
    /// More ops were discovered; the caller should resolve and resend.
    Incomplete {
        run_id: Uuid,
        ops: Vec<DiscoveredOp>,
    },
}

impl CheckpointResponse {
    /// HTTP status code conventionally paired with this response.
    pub fn http_status(&self) -> u16 {
        match self {
            CheckpointResponse::Complete { .. } => 200,
            CheckpointResponse::Failed { .. } => 500,
            CheckpointResponse::Incomplete { .. } => 206,
        }
    }
}
