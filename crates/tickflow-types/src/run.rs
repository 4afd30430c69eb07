//! Run bookkeeping and waiting registries.
//!
//! A `Run` is one logical workflow execution, exclusively owned by the state
//! store. The orchestrator and driver only read/write through the store
//! contract and never hold a run beyond a single handler invocation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JsonError;
use crate::event::EventInput;

/// Default maximum attempts per op (and per workflow-level result).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The input context a run carries through every replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCtx {
    /// The trigger event that created the run.
    pub input: EventInput,
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Success { output: Value },
    Error { error: JsonError },
}

/// One logical workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Globally unique run id (UUIDv7).
    pub id: Uuid,
    /// The workflow definition this run executes.
    pub workflow_id: String,
    /// Input context (the triggering event).
    pub ctx: RunCtx,
    /// Attempt budget applied per op and at workflow level.
    pub max_attempts: u32,
    /// Attempt counters keyed by hashed op id.
    #[serde(default)]
    pub op_attempts: HashMap<String, u32>,
    /// Terminal result; `None` while the run is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a fresh run for the given workflow and trigger event.
    pub fn new(workflow_id: impl Into<String>, input: EventInput, max_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            ctx: RunCtx { input },
            max_attempts,
            op_attempts: HashMap::new(),
            result: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A run is terminal once a result has been persisted.
    pub fn is_terminal(&self) -> bool {
        self.result.is_some()
    }
}

// ---------------------------------------------------------------------------
// Waiting registries
// ---------------------------------------------------------------------------

/// Registry entry linking an external signal name to the run/op waiting on it.
///
/// Created when a `wait_for_signal` op is planned; consumed exactly once by
/// either the incoming signal or the timeout, whichever pops it first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingSignal {
    pub signal: String,
    pub run_id: Uuid,
    pub hashed_op_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Registry entry linking a child run to the parent run/op that invoked it.
///
/// Consumed exactly once by either the child's completion or the invoke
/// timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingInvoke {
    pub child_run_id: Uuid,
    pub parent_run_id: Uuid,
    pub hashed_op_id: String,
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_TYPE_START;
    use serde_json::json;

    #[test]
    fn new_run_is_not_terminal() {
        let run = Run::new(
            "billing",
            EventInput::now("billing", EVENT_TYPE_START, json!({})),
            DEFAULT_MAX_ATTEMPTS,
        );
        assert!(!run.is_terminal());
        assert!(run.op_attempts.is_empty());
        assert_eq!(run.max_attempts, 3);
    }

    #[test]
    fn run_round_trips_with_result() {
        let mut run = Run::new(
            "billing",
            EventInput::now("billing", EVENT_TYPE_START, json!({"x": 1})),
            2,
        );
        run.op_attempts.insert("abc".to_string(), 2);
        run.result = Some(RunResult::Error {
            error: JsonError::non_retryable("Error", "exhausted"),
        });
        run.completed_at = Some(Utc::now());

        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
        assert!(back.is_terminal());
    }
}
