//! The execution driver: classifies discovered ops against the store.
//!
//! Memoization guarantee: a given op id/index in a given run executes its
//! handler at most once per attempt across the lifetime of the run. The
//! stored `can_retry` flag is the sole authority — a settled result (success
//! or non-retryable error) is released from memory; a retryable error means
//! the op executes again.

use std::sync::atomic::Ordering;

use tickflow_types::error::JsonError;
use tickflow_types::op::{OpOutcome, OpResult};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::discovery::{self, BatchHandler, Verdict, workflow_op_result};
use crate::error::EngineError;
use crate::step::FoundOp;
use crate::store::StateStore;
use crate::workflow::{Workflow, WorkflowCtx};

/// Run one tick of `workflow` for `run`, persisting every produced result.
///
/// One call never resolves more than the newly discovered batch; the caller
/// advances the run by calling `execute` again.
///
/// When `target_hashed_op_id` is set, only the matching op executes this
/// call; sibling new ops are persisted as plans without running their
/// handlers (the one-step-per-invocation checkpoint protocol).
pub async fn execute<S: StateStore>(
    store: &S,
    workflow: &Workflow,
    run: &tickflow_types::run::Run,
    target_hashed_op_id: Option<String>,
) -> Result<Vec<OpResult>, EngineError> {
    let mut input = run.ctx.input.clone();
    if let Some(validator) = workflow.validator() {
        match validator.validate(&input.data) {
            Ok(value) => input.data = value,
            Err(issues) => {
                debug!(run_id = %run.id, issues = issues.len(), "input validation failed");
                let error = JsonError::invalid_input(&issues);
                let result = workflow_op_result(
                    run.id,
                    &run.workflow_id,
                    OpOutcome::Error { error },
                );
                store.set_op(&result, false).await?;
                return Ok(vec![result]);
            }
        }
    }

    let ctx = WorkflowCtx {
        run_id: run.id,
        workflow_id: run.workflow_id.clone(),
        input,
    };
    let mut sink = DriverSink {
        store,
        run_id: run.id,
        workflow_id: run.workflow_id.clone(),
        target: target_hashed_op_id,
    };
    discovery::run_tick(workflow, ctx, &mut sink).await
}

struct DriverSink<'a, S> {
    store: &'a S,
    run_id: Uuid,
    workflow_id: String,
    target: Option<String>,
}

impl<S: StateStore> DriverSink<'_, S> {
    /// Whether this op's handler may run during this call.
    fn may_execute(&self, hashed: &str) -> bool {
        match &self.target {
            Some(target) => target == hashed,
            None => true,
        }
    }

    fn result_for(&self, found: &FoundOp, outcome: OpOutcome) -> OpResult {
        OpResult {
            config: found.config.clone(),
            op_id: found.op_id.clone(),
            outcome,
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
        }
    }
}

impl<S: StateStore> BatchHandler for DriverSink<'_, S> {
    async fn on_ops_found(&mut self, batch: Vec<FoundOp>) -> Result<Verdict, EngineError> {
        let mut results = Vec::new();
        let mut released = 0usize;

        for found in batch {
            let stored = self.store.get_op(self.run_id, &found.op_id.hashed).await?;
            match stored {
                // Settled: replay the stored outcome, never re-execute.
                Some(existing) if existing.outcome.is_settled() => {
                    trace!(
                        run_id = %self.run_id,
                        op = %found.op_id.id,
                        "op resolved from memo ledger"
                    );
                    match existing.outcome {
                        OpOutcome::Success { output } => found.release(Ok(output)),
                        OpOutcome::Error { error } => found.release(Err(error)),
                        OpOutcome::Plan => {}
                    }
                    released += 1;
                    continue;
                }
                // Still planned and not executed this call: stays parked
                // until its external event resolves it.
                Some(existing)
                    if existing.outcome.is_plan()
                        && !(found.has_handler() && self.may_execute(&found.op_id.hashed)) =>
                {
                    continue;
                }
                // Retryable error, a targeted plan, or unseen: treat as new.
                _ => {}
            }

            if found.has_handler() && self.may_execute(&found.op_id.hashed) {
                let FoundOp {
                    config,
                    op_id,
                    handler,
                    gate,
                    executing,
                } = found;
                let Some(handler) = handler else { continue };
                debug!(run_id = %self.run_id, op = %op_id.id, "executing op");
                executing.store(true, Ordering::SeqCst);
                let outcome = handler().await;
                executing.store(false, Ordering::SeqCst);

                let op_outcome = match &outcome {
                    Ok(output) => OpOutcome::Success {
                        output: output.clone(),
                    },
                    Err(error) => OpOutcome::Error {
                        error: error.clone(),
                    },
                };
                let result = OpResult {
                    config,
                    op_id,
                    outcome: op_outcome,
                    run_id: self.run_id,
                    workflow_id: self.workflow_id.clone(),
                };
                self.store.set_op(&result, false).await?;
                results.push(result);
                gate.release(outcome);
            } else {
                // Scheduled op, or an immediate op skipped by targeting:
                // persist the plan and leave the caller parked.
                debug!(run_id = %self.run_id, op = %found.op_id.id, "op planned");
                let result = self.result_for(&found, OpOutcome::Plan);
                self.store.set_op(&result, false).await?;
                results.push(result);
            }
        }

        if !results.is_empty() {
            Ok(Verdict::Interrupt(results))
        } else if released > 0 {
            Ok(Verdict::Continue)
        } else {
            // Everything in the batch is already planned and waiting.
            Ok(Verdict::Interrupt(Vec::new()))
        }
    }

    async fn on_workflow_result(&mut self, result: OpResult) -> Result<OpResult, EngineError> {
        self.store.set_op(&result, false).await?;
        Ok(result)
    }
}
