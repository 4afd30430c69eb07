//! The op discovery loop: one replay tick of a workflow function.
//!
//! The workflow future is polled manually on the current task, never
//! spawned. Each loop iteration is one cooperative suspension point: a
//! single poll lets every op triggered "in parallel" accumulate into one
//! batch before any of them is classified, so a join-style fan-out is
//! discovered as a group rather than one at a time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use serde_json::Value;
use tickflow_types::error::JsonError;
use tickflow_types::op::{OpConfig, OpId, OpOutcome, OpResult};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::ident::{WORKFLOW_OP_ID, hash_op_id};
use crate::step::{FoundOp, Step, TickState, TickStateHandle, lock_state};
use crate::workflow::{Workflow, WorkflowCtx};

/// Hard cap on loop iterations per tick. Exceeding it means the workflow
/// body suspends on something other than step ops and cannot make progress.
pub const MAX_TICK_ITERATIONS: usize = 4096;

/// What the batch handler tells the loop to do next.
#[derive(Debug)]
pub enum Verdict {
    /// Gates were released; keep polling the workflow future.
    Continue,
    /// Stop the tick and return these results immediately.
    Interrupt(Vec<OpResult>),
}

/// The driver seam: classifies each discovered batch and persists outcomes.
pub trait BatchHandler: Send {
    fn on_ops_found(
        &mut self,
        batch: Vec<FoundOp>,
    ) -> impl std::future::Future<Output = Result<Verdict, EngineError>> + Send;

    /// Persists the synthesized workflow-level result and returns it.
    fn on_workflow_result(
        &mut self,
        result: OpResult,
    ) -> impl std::future::Future<Output = Result<OpResult, EngineError>> + Send;
}

/// Synthesize the workflow-level op result for a run.
pub(crate) fn workflow_op_result(
    run_id: Uuid,
    workflow_id: &str,
    outcome: OpOutcome,
) -> OpResult {
    OpResult {
        config: OpConfig::workflow(),
        op_id: OpId {
            hashed: hash_op_id(WORKFLOW_OP_ID, 0),
            id: WORKFLOW_OP_ID.to_string(),
            index: 0,
        },
        outcome,
        run_id,
        workflow_id: workflow_id.to_string(),
    }
}

/// Drive one replay of the workflow handler.
///
/// Returns the results the tick produced: the interrupt batch, the
/// workflow-level result, or nothing when the future is parked on ops that
/// resolve in a later tick.
pub async fn run_tick<H: BatchHandler>(
    workflow: &Workflow,
    ctx: WorkflowCtx,
    sink: &mut H,
) -> Result<Vec<OpResult>, EngineError> {
    let run_id = ctx.run_id;
    let workflow_id = ctx.workflow_id.clone();

    let state: TickStateHandle = Arc::new(Mutex::new(TickState::default()));
    let pending = Arc::new(AtomicUsize::new(0));
    let executing = Arc::new(AtomicBool::new(false));
    let step = Step::new(Arc::clone(&state), Arc::clone(&pending), executing);

    let mut fut = workflow.call(ctx, step);
    let mut done: Option<Result<Value, JsonError>> = None;

    for _ in 0..MAX_TICK_ITERATIONS {
        if done.is_none() {
            let polled =
                std::future::poll_fn(|cx| Poll::Ready(fut.as_mut().poll(cx))).await;
            if let Poll::Ready(result) = polled {
                done = Some(result);
            }
        }

        let batch = std::mem::take(&mut lock_state(&state).batch);
        if !batch.is_empty() {
            trace!(run_id = %run_id, ops = batch.len(), "ops discovered");
            match sink.on_ops_found(batch).await? {
                Verdict::Continue => continue,
                Verdict::Interrupt(results) => return Ok(results),
            }
        }

        if let Some(result) = done.take() {
            let outcome = match result {
                Ok(output) => OpOutcome::Success { output },
                Err(error) => OpOutcome::Error { error },
            };
            let synthesized = workflow_op_result(run_id, &workflow_id, outcome);
            let persisted = sink.on_workflow_result(synthesized).await?;
            return Ok(vec![persisted]);
        }

        if pending.load(Ordering::SeqCst) > 0 {
            // Parked on ops awaiting external resolution; the tick is over.
            return Ok(Vec::new());
        }

        // Pending on something that is not a step op. Yield and re-poll; a
        // future that never turns into a step call trips the iteration cap.
        tokio::task::yield_now().await;
    }

    warn!(run_id = %run_id, "tick exceeded the iteration cap");
    Err(EngineError::Internal(format!(
        "discovery did not settle within {MAX_TICK_ITERATIONS} iterations; \
         workflow bodies must suspend only on step ops"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tickflow_types::event::{EVENT_TYPE_START, EventInput};
    use tickflow_types::op::OpKind;
    use tickflow_types::workflow::WorkflowConfig;

    /// Releases every immediate op by running its handler inline and parks
    /// everything else; records batch sizes.
    struct InlineSink {
        batch_sizes: Vec<usize>,
        results: Vec<OpResult>,
    }

    impl InlineSink {
        fn new() -> Self {
            Self {
                batch_sizes: Vec::new(),
                results: Vec::new(),
            }
        }
    }

    impl BatchHandler for InlineSink {
        async fn on_ops_found(&mut self, batch: Vec<FoundOp>) -> Result<Verdict, EngineError> {
            self.batch_sizes.push(batch.len());
            for found in batch {
                let FoundOp {
                    config,
                    op_id,
                    handler,
                    gate,
                    executing,
                } = found;
                match handler {
                    Some(handler) => {
                        executing.store(true, Ordering::SeqCst);
                        let outcome = handler().await;
                        executing.store(false, Ordering::SeqCst);
                        self.results.push(OpResult {
                            config,
                            op_id,
                            outcome: match &outcome {
                                Ok(output) => OpOutcome::Success {
                                    output: output.clone(),
                                },
                                Err(error) => OpOutcome::Error {
                                    error: error.clone(),
                                },
                            },
                            run_id: Uuid::nil(),
                            workflow_id: "test".to_string(),
                        });
                        gate.release(outcome);
                    }
                    None => {
                        // Scheduled op: resolve instantly so the tick can end.
                        gate.release(Ok(Value::Null));
                    }
                }
            }
            Ok(Verdict::Continue)
        }

        async fn on_workflow_result(&mut self, result: OpResult) -> Result<OpResult, EngineError> {
            Ok(result)
        }
    }

    fn ctx_for(workflow_id: &str) -> WorkflowCtx {
        WorkflowCtx {
            run_id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            input: EventInput::now(workflow_id, EVENT_TYPE_START, json!({})),
        }
    }

    #[tokio::test]
    async fn sequential_ops_arrive_in_separate_batches() {
        let workflow = Workflow::new(WorkflowConfig::new("seq"), |_ctx, step| async move {
            let a: String = step.run("a", || async { Ok("A".to_string()) }).await?;
            let b: String = step.run("b", || async { Ok("B".to_string()) }).await?;
            Ok(json!(format!("{a},{b}")))
        });

        let mut sink = InlineSink::new();
        let results = run_tick(&workflow, ctx_for("seq"), &mut sink).await.unwrap();

        assert_eq!(sink.batch_sizes, vec![1, 1]);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].config.kind, OpKind::Workflow));
        assert_eq!(
            results[0].outcome,
            OpOutcome::Success {
                output: json!("A,B")
            }
        );
    }

    #[tokio::test]
    async fn parallel_fan_out_is_one_batch() {
        let workflow = Workflow::new(WorkflowConfig::new("par"), |_ctx, step| async move {
            let (a, b, c, d) = tokio::join!(
                step.run::<i64, _, _>("a", || async { Ok(1) }),
                step.run::<i64, _, _>("b", || async { Ok(2) }),
                step.sleep("c", std::time::Duration::from_millis(10)),
                step.sleep("d", std::time::Duration::from_millis(10)),
            );
            a?;
            b?;
            c?;
            d?;
            Ok(json!("done"))
        });

        let mut sink = InlineSink::new();
        run_tick(&workflow, ctx_for("par"), &mut sink).await.unwrap();

        assert_eq!(sink.batch_sizes, vec![4]);
    }

    #[tokio::test]
    async fn handler_error_becomes_workflow_error() {
        let workflow = Workflow::new(WorkflowConfig::new("boom"), |_ctx, _step| async move {
            Err(JsonError::non_retryable("PaymentDeclined", "card rejected"))
        });

        let mut sink = InlineSink::new();
        let results = run_tick(&workflow, ctx_for("boom"), &mut sink).await.unwrap();

        match &results[0].outcome {
            OpOutcome::Error { error } => {
                assert_eq!(error.name, "PaymentDeclined");
                assert!(!error.can_retry);
            }
            other => panic!("expected error outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn op_inside_op_fails_without_retry() {
        let workflow = Workflow::new(WorkflowConfig::new("nest"), |_ctx, step| {
            let inner_step = step.clone();
            async move {
                let value: i64 = step
                    .run("outer", move || async move {
                        inner_step.run("inner", || async { Ok(1) }).await
                    })
                    .await?;
                Ok(json!(value))
            }
        });

        let mut sink = InlineSink::new();
        let results = run_tick(&workflow, ctx_for("nest"), &mut sink).await.unwrap();

        match &results[0].outcome {
            OpOutcome::Error { error } => {
                assert!(error.name.contains("NestedOp"));
                assert!(!error.can_retry);
            }
            other => panic!("expected nested-op error, got {other:?}"),
        }
    }
}
