//! Operation types: identity, configuration, and persisted results.
//!
//! An op is one durable unit inside a run. During discovery it exists as an
//! in-flight record owned by the engine (see `tickflow-core`); once resolved
//! it is persisted as an `OpResult` keyed by its hashed id. The identity
//! invariant is `op_id.hashed = hash(id, index)` where `index` counts
//! occurrences of the same human-assigned id within one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JsonError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Deterministic identity of an op within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpId {
    /// Storage key: hash of `id` and `index`.
    pub hashed: String,
    /// Human-assigned op id (e.g. "charge-card").
    pub id: String,
    /// Occurrence index of `id` within the run (0 for the first use).
    pub index: u32,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// When an op's handler runs relative to its discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpMode {
    /// Executed synchronously when first discovered.
    Immediate,
    /// Persisted as a plan; resolved later by a queue wakeup.
    Scheduled,
}

/// The kind of work an op represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Run a unit of user work.
    Run,
    /// Suspend until a wall-clock instant.
    Sleep { until: DateTime<Utc> },
    /// Suspend until an external signal arrives (or the timeout fires).
    WaitForSignal { signal: String, timeout_ms: u64 },
    /// Start a child run and suspend until it finishes (or times out).
    InvokeWorkflow {
        workflow: String,
        #[serde(default)]
        input: Value,
        timeout_ms: u64,
    },
    /// Synthesized workflow-level result of the whole run.
    Workflow,
}

/// Full op configuration: kind plus execution mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpConfig {
    #[serde(flatten)]
    pub kind: OpKind,
    pub mode: OpMode,
}

impl OpConfig {
    pub fn run() -> Self {
        Self {
            kind: OpKind::Run,
            mode: OpMode::Immediate,
        }
    }

    pub fn sleep(until: DateTime<Utc>) -> Self {
        Self {
            kind: OpKind::Sleep { until },
            mode: OpMode::Scheduled,
        }
    }

    pub fn wait_for_signal(signal: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            kind: OpKind::WaitForSignal {
                signal: signal.into(),
                timeout_ms,
            },
            mode: OpMode::Scheduled,
        }
    }

    pub fn invoke_workflow(workflow: impl Into<String>, input: Value, timeout_ms: u64) -> Self {
        Self {
            kind: OpKind::InvokeWorkflow {
                workflow: workflow.into(),
                input,
                timeout_ms,
            },
            mode: OpMode::Scheduled,
        }
    }

    pub fn workflow() -> Self {
        Self {
            kind: OpKind::Workflow,
            mode: OpMode::Immediate,
        }
    }

    /// Short lowercase label for the kind ("run", "sleep", ...).
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            OpKind::Run => "run",
            OpKind::Sleep { .. } => "sleep",
            OpKind::WaitForSignal { .. } => "wait_for_signal",
            OpKind::InvokeWorkflow { .. } => "invoke_workflow",
            OpKind::Workflow => "workflow",
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// The persisted resolution state of an op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OpOutcome {
    /// The op finished and produced an output value.
    Success { output: Value },
    /// The op failed. Retry eligibility lives on the error itself.
    Error { error: JsonError },
    /// Discovered, not yet resolved; awaiting an external event.
    Plan,
}

impl OpOutcome {
    /// A settled outcome is never overwritten by a plain `set_op`.
    ///
    /// Success and non-retryable errors are settled; a plan or a retryable
    /// error may still be replaced by a later resolution.
    pub fn is_settled(&self) -> bool {
        match self {
            OpOutcome::Success { .. } => true,
            OpOutcome::Error { error } => !error.can_retry,
            OpOutcome::Plan => false,
        }
    }

    pub fn is_plan(&self) -> bool {
        matches!(self, OpOutcome::Plan)
    }
}

/// A persisted op result: the durable ledger entry for one op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub config: OpConfig,
    pub op_id: OpId,
    pub outcome: OpOutcome,
    pub run_id: Uuid,
    pub workflow_id: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn op_config_serializes_with_flattened_kind() {
        let config = OpConfig::wait_for_signal("payment.confirmed", 60_000);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "wait_for_signal");
        assert_eq!(json["signal"], "payment.confirmed");
        assert_eq!(json["mode"], "scheduled");
    }

    #[test]
    fn settled_rules() {
        assert!(OpOutcome::Success { output: json!(1) }.is_settled());
        assert!(!OpOutcome::Plan.is_settled());
        assert!(
            !OpOutcome::Error {
                error: JsonError::new("Error", "transient")
            }
            .is_settled()
        );
        assert!(
            OpOutcome::Error {
                error: JsonError::non_retryable("Error", "fatal")
            }
            .is_settled()
        );
    }

    #[test]
    fn op_result_round_trips() {
        let result = OpResult {
            config: OpConfig::run(),
            op_id: OpId {
                hashed: "abc123".to_string(),
                id: "charge".to_string(),
                index: 0,
            },
            outcome: OpOutcome::Success {
                output: json!({"amount": 42}),
            },
            run_id: Uuid::now_v7(),
            workflow_id: "billing".to_string(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: OpResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(OpConfig::run().kind_label(), "run");
        assert_eq!(OpConfig::sleep(Utc::now()).kind_label(), "sleep");
        assert_eq!(
            OpConfig::invoke_workflow("child", json!(null), 1000).kind_label(),
            "invoke_workflow"
        );
    }
}
