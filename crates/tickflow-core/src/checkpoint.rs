//! Transport-free executor for the checkpoint wire protocol.
//!
//! A remote runner drives a workflow one pass per request: it carries the
//! memoized step results it holds (`steps` seeds), optionally marks one op
//! to execute server-side (a null-valued step), and receives either the
//! terminal workflow outcome or descriptors of the ops the pass surfaced.
//! HTTP adapters live outside this crate; they map [`CheckpointResponse`]
//! to a status code via `http_status`.

use serde_json::json;
use tickflow_types::event::{EVENT_TYPE_START, EventInput};
use tickflow_types::op::{OpConfig, OpId, OpKind, OpOutcome, OpResult};
use tickflow_types::run::{Run, RunResult};
use tickflow_types::wire::{CheckpointRequest, CheckpointResponse, DiscoveredOp, StepSeed};
use tracing::debug;

use crate::driver;
use crate::error::EngineError;
use crate::store::StateStore;
use crate::workflow::Workflow;

/// Run one checkpoint pass: seed the store from the request, execute a
/// single targeted driver call, and describe what came out.
pub async fn handle_checkpoint_request<S: StateStore>(
    store: &S,
    workflow: &Workflow,
    request: CheckpointRequest,
) -> Result<CheckpointResponse, EngineError> {
    let run = match request.ctx.run_id {
        Some(run_id) => store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?,
        None => {
            let data = request.input.clone().unwrap_or_default();
            let event = EventInput::now(workflow.config.id.clone(), EVENT_TYPE_START, data);
            let run = Run::new(workflow.config.id.clone(), event, workflow.max_attempts());
            store.add_run(&run).await?;
            debug!(run_id = %run.id, workflow = %workflow.config.id, "checkpoint run created");
            run
        }
    };

    // Seed the ledger with the results the caller carries.
    for (hashed, seed) in &request.steps {
        let Some(seed) = seed else { continue };
        let outcome = match seed {
            StepSeed::Data { data } => OpOutcome::Success {
                output: data.clone(),
            },
            StepSeed::Error { error } => OpOutcome::Error {
                error: error.clone(),
            },
        };
        let op = match store.get_op(run.id, hashed).await? {
            Some(mut existing) => {
                existing.outcome = outcome;
                existing
            }
            // First sighting of this op on the server; the caller only
            // knows it by hash.
            None => OpResult {
                config: OpConfig::run(),
                op_id: OpId {
                    hashed: hashed.clone(),
                    id: hashed.clone(),
                    index: 0,
                },
                outcome,
                run_id: run.id,
                workflow_id: run.workflow_id.clone(),
            },
        };
        store.set_op(&op, false).await?;
    }

    let target = request.target().map(str::to_string);
    let results = driver::execute(store, workflow, &run, target).await?;

    // A terminal workflow outcome ends the run.
    if let Some(terminal) = results
        .iter()
        .find(|r| matches!(r.config.kind, OpKind::Workflow))
    {
        return match &terminal.outcome {
            OpOutcome::Success { output } => {
                store
                    .finish_run(
                        run.id,
                        &RunResult::Success {
                            output: output.clone(),
                        },
                    )
                    .await?;
                Ok(CheckpointResponse::Complete {
                    run_id: run.id,
                    output: output.clone(),
                })
            }
            OpOutcome::Error { error } => {
                store
                    .finish_run(
                        run.id,
                        &RunResult::Error {
                            error: error.clone(),
                        },
                    )
                    .await?;
                Ok(CheckpointResponse::Failed {
                    run_id: run.id,
                    error: error.clone(),
                })
            }
            OpOutcome::Plan => Ok(CheckpointResponse::Incomplete {
                run_id: run.id,
                ops: Vec::new(),
            }),
        };
    }

    // A pass that surfaced nothing new means the run is parked on ops
    // planned earlier; describe those from the ledger so the caller still
    // learns what it is waiting on.
    let ops = if results.is_empty() {
        store
            .list_ops(run.id)
            .await?
            .iter()
            .filter(|op| op.outcome.is_plan())
            .map(|op| describe_op(op))
            .collect()
    } else {
        results.iter().map(describe_op).collect()
    };
    Ok(CheckpointResponse::Incomplete { run_id: run.id, ops })
}

/// Describe one pass result for the caller's next request.
fn describe_op(result: &OpResult) -> DiscoveredOp {
    let data = match (&result.outcome, &result.config.kind) {
        (OpOutcome::Success { output }, _) => Some(output.clone()),
        (OpOutcome::Error { error }, _) => serde_json::to_value(error).ok(),
        (OpOutcome::Plan, OpKind::Sleep { until }) => Some(json!({ "until": until })),
        (OpOutcome::Plan, OpKind::WaitForSignal { signal, timeout_ms }) => {
            Some(json!({ "signal": signal, "timeout_ms": timeout_ms }))
        }
        (
            OpOutcome::Plan,
            OpKind::InvokeWorkflow {
                workflow,
                timeout_ms,
                ..
            },
        ) => Some(json!({ "workflow": workflow, "timeout_ms": timeout_ms })),
        (OpOutcome::Plan, _) => None,
    };
    DiscoveredOp {
        id: result.op_id.hashed.clone(),
        op: result.config.kind_label().to_string(),
        name: result.op_id.id.clone(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tickflow_types::error::JsonError;
    use tickflow_types::wire::CheckpointCtx;
    use tickflow_types::workflow::WorkflowConfig;

    use crate::memory::MemoryStateStore;

    fn two_step_workflow() -> Workflow {
        Workflow::new(WorkflowConfig::new("seq"), |_ctx, step| async move {
            let a: String = step.run("a", || async { Ok("A".to_string()) }).await?;
            let b: String = step.run("b", || async { Ok("B".to_string()) }).await?;
            Ok(json!(format!("{a},{b}")))
        })
    }

    fn first_request() -> CheckpointRequest {
        CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: None,
            },
            input: Some(json!({})),
            steps: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn passes_advance_one_batch_at_a_time() {
        let store = MemoryStateStore::new();
        let workflow = two_step_workflow();

        // Pass 1: creates the run, executes "a".
        let response = handle_checkpoint_request(&store, &workflow, first_request())
            .await
            .unwrap();
        let (run_id, ops) = match response {
            CheckpointResponse::Incomplete { run_id, ops } => (run_id, ops),
            other => panic!("expected incomplete, got {other:?}"),
        };
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].name, "a");
        assert_eq!(ops[0].op, "run");
        assert_eq!(ops[0].data, Some(json!("A")));

        // Pass 2: "a" replays from the ledger, "b" executes.
        let request = CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: Some(run_id),
            },
            input: None,
            steps: BTreeMap::new(),
        };
        let response = handle_checkpoint_request(&store, &workflow, request)
            .await
            .unwrap();
        match &response {
            CheckpointResponse::Incomplete { ops, .. } => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].name, "b");
            }
            other => panic!("expected incomplete, got {other:?}"),
        }

        // Pass 3: everything replays; the workflow completes.
        let request = CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: Some(run_id),
            },
            input: None,
            steps: BTreeMap::new(),
        };
        let response = handle_checkpoint_request(&store, &workflow, request)
            .await
            .unwrap();
        match response {
            CheckpointResponse::Complete { output, .. } => assert_eq!(output, json!("A,B")),
            other => panic!("expected complete, got {other:?}"),
        }
        assert_eq!(response_status(&store, run_id).await, Some(true));
    }

    async fn response_status(store: &MemoryStateStore, run_id: uuid::Uuid) -> Option<bool> {
        store
            .get_run(run_id)
            .await
            .unwrap()
            .and_then(|r| r.result)
            .map(|r| matches!(r, RunResult::Success { .. }))
    }

    #[tokio::test]
    async fn seeded_error_replays_into_the_workflow() {
        let store = MemoryStateStore::new();
        let workflow = two_step_workflow();

        let response = handle_checkpoint_request(&store, &workflow, first_request())
            .await
            .unwrap();
        let (run_id, hashed_a) = match response {
            CheckpointResponse::Incomplete { run_id, ops } => (run_id, ops[0].id.clone()),
            other => panic!("expected incomplete, got {other:?}"),
        };

        // Seed a non-retryable failure for "a": the workflow fails.
        let mut steps = BTreeMap::new();
        steps.insert(
            hashed_a,
            Some(StepSeed::Error {
                error: JsonError::non_retryable("UpstreamGone", "no such host"),
            }),
        );
        let request = CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: Some(run_id),
            },
            input: None,
            steps,
        };
        let response = handle_checkpoint_request(&store, &workflow, request)
            .await
            .unwrap();
        match response {
            CheckpointResponse::Failed { error, .. } => assert_eq!(error.name, "UpstreamGone"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_step_targets_a_single_op() {
        let store = MemoryStateStore::new();
        let workflow = Workflow::new(WorkflowConfig::new("fanout"), |_ctx, step| async move {
            let (a, b) = tokio::join!(
                step.run::<i64, _, _>("a", || async { Ok(1) }),
                step.run::<i64, _, _>("b", || async { Ok(2) }),
            );
            Ok(json!([a?, b?]))
        });

        // Target an op hash that matches nothing: both ops come back as
        // plans, neither executed.
        let mut request = first_request();
        request.steps.insert("unknown".to_string(), None);
        let response = handle_checkpoint_request(&store, &workflow, request)
            .await
            .unwrap();
        let (run_id, ops) = match response {
            CheckpointResponse::Incomplete { run_id, ops } => (run_id, ops),
            other => panic!("expected incomplete, got {other:?}"),
        };
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.data.is_none()));

        // Now target "a" alone: only "a" runs.
        let mut steps = BTreeMap::new();
        steps.insert(ops[0].id.clone(), None);
        let request = CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: Some(run_id),
            },
            input: None,
            steps,
        };
        let response = handle_checkpoint_request(&store, &workflow, request)
            .await
            .unwrap();
        match &response {
            CheckpointResponse::Incomplete { ops, .. } => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].data, Some(json!(1)));
            }
            other => panic!("expected incomplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn parked_run_reports_its_outstanding_plans() {
        let store = MemoryStateStore::new();
        let workflow = Workflow::new(WorkflowConfig::new("napper"), |_ctx, step| async move {
            step.sleep("nap", std::time::Duration::from_secs(3600))
                .await?;
            Ok(json!("rested"))
        });

        // Pass 1: the sleep is planned and surfaced.
        let response = handle_checkpoint_request(&store, &workflow, first_request())
            .await
            .unwrap();
        let run_id = match response {
            CheckpointResponse::Incomplete { run_id, ops } => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].op, "sleep");
                run_id
            }
            other => panic!("expected incomplete, got {other:?}"),
        };

        // Pass 2: nothing new happens, but the parked sleep is still
        // described from the ledger rather than an empty list.
        let request = CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: Some(run_id),
            },
            input: None,
            steps: BTreeMap::new(),
        };
        let response = handle_checkpoint_request(&store, &workflow, request)
            .await
            .unwrap();
        match response {
            CheckpointResponse::Incomplete { ops, .. } => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].name, "nap");
                assert_eq!(ops[0].op, "sleep");
                assert!(ops[0].data.is_some());
            }
            other => panic!("expected incomplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_run_id_is_an_error() {
        let store = MemoryStateStore::new();
        let workflow = two_step_workflow();
        let request = CheckpointRequest {
            ctx: CheckpointCtx {
                attempt: 1,
                run_id: Some(uuid::Uuid::now_v7()),
            },
            input: None,
            steps: BTreeMap::new(),
        };
        let result = handle_checkpoint_request(&store, &workflow, request).await;
        assert!(matches!(result, Err(EngineError::RunNotFound(_))));
    }
}
