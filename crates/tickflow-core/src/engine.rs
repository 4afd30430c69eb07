//! The orchestrator: turns queue items into ticks and op outcomes into
//! scheduled work.
//!
//! Per-run state machine, driven by the exec queue:
//! - a trigger creates the run and enqueues an immediate discover item;
//! - a discover item runs one driver tick and interprets each result
//!   (terminal workflow outcome, step retry, or a plan that registers a
//!   timer / signal wait / child invocation);
//! - timeout items are stale-checked against the waiting registries so a
//!   resolution that raced the timeout wins if it persisted first.
//!
//! Store or queue failures while handling an item are logged and the item
//! dropped; other runs must keep progressing.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tickflow_types::error::JsonError;
use tickflow_types::event::{
    EVENT_TYPE_CRON, EVENT_TYPE_INVOKE, EVENT_TYPE_START, EventInput, TriggerConfig,
};
use tickflow_types::op::{OpKind, OpOutcome, OpResult};
use tickflow_types::queue::{ExecItem, TriggerItem};
use tickflow_types::run::{Run, RunResult, WaitingInvoke, WaitingSignal};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver;
use crate::error::EngineError;
use crate::queue::{QueuePoller, WorkQueue, spawn_poller};
use crate::store::StateStore;
use crate::trigger::{CronScheduler, TriggerError};
use crate::workflow::Workflow;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What [`Engine::start`] hands back to a fire-and-forget caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReceipt {
    pub event_id: Uuid,
    pub run_id: Uuid,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The workflow engine, generic over a state store and the two work queues.
pub struct Engine<S, EQ, XQ> {
    store: Arc<S>,
    event_queue: Arc<EQ>,
    exec_queue: Arc<XQ>,
    workflows: DashMap<String, Arc<Workflow>>,
    poll_interval: Duration,
    pollers: Mutex<Vec<QueuePoller>>,
    cron: Mutex<Option<CronScheduler>>,
}

impl<S, EQ, XQ> Engine<S, EQ, XQ>
where
    S: StateStore,
    EQ: WorkQueue<TriggerItem>,
    XQ: WorkQueue<ExecItem>,
{
    pub fn new(store: Arc<S>, event_queue: Arc<EQ>, exec_queue: Arc<XQ>) -> Self {
        Self {
            store,
            event_queue,
            exec_queue,
            workflows: DashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            pollers: Mutex::new(Vec::new()),
            cron: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register a workflow definition under its configured id.
    pub fn register(&self, workflow: Workflow) {
        let id = workflow.config.id.clone();
        self.workflows.insert(id, Arc::new(workflow));
    }

    // -----------------------------------------------------------------------
    // Client surface
    // -----------------------------------------------------------------------

    /// Start a run and return immediately.
    pub async fn start(&self, workflow_id: &str, data: Value) -> Result<StartReceipt, EngineError> {
        let workflow = self.workflow(workflow_id)?;
        let event = EventInput::now(workflow_id, EVENT_TYPE_START, data);
        let event_id = event.id;
        let run_id = self.start_run(&workflow, event).await?;
        Ok(StartReceipt { event_id, run_id })
    }

    /// Start a run and block until it reaches a terminal result.
    pub async fn invoke(&self, workflow_id: &str, data: Value) -> Result<Value, EngineError> {
        let receipt = self.start(workflow_id, data).await?;
        self.wait_for_result(receipt.run_id).await
    }

    /// Poll the run record until a terminal result exists.
    pub async fn wait_for_result(&self, run_id: Uuid) -> Result<Value, EngineError> {
        loop {
            let run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or(EngineError::RunNotFound(run_id))?;
            if let Some(result) = run.result {
                return match result {
                    RunResult::Success { output } => Ok(output),
                    RunResult::Error { error } => Err(EngineError::RunFailed(error)),
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Enqueue a trigger event for routing to matching workflows.
    pub async fn publish(&self, event: EventInput) -> Result<(), EngineError> {
        self.event_queue
            .add(&TriggerItem { event }, Utc::now())
            .await?;
        Ok(())
    }

    /// Deliver an external signal. Returns the resumed run id, or `None`
    /// when nobody was waiting (the signal is dropped, not queued).
    pub async fn send_signal(
        &self,
        signal: &str,
        data: Value,
    ) -> Result<Option<Uuid>, EngineError> {
        let Some(waiting) = self.store.pop_waiting_signal(signal).await? else {
            debug!(signal, "signal dropped: no run waiting");
            return Ok(None);
        };
        let payload = json!({ "data": data, "signal": signal });
        self.finalize_op(
            waiting.run_id,
            &waiting.hashed_op_id,
            OpOutcome::Success { output: payload },
            false,
        )
        .await?;
        self.enqueue_discover(waiting.run_id, Utc::now()).await?;
        Ok(Some(waiting.run_id))
    }

    // -----------------------------------------------------------------------
    // Background processing
    // -----------------------------------------------------------------------

    /// Spawn the trigger and exec pollers.
    pub fn start_pollers(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let trigger_poller = spawn_poller(
            Arc::clone(&self.event_queue),
            self.poll_interval,
            move |item| {
                let engine = Arc::clone(&engine);
                async move { engine.handle_trigger_item(item).await }
            },
        );
        let engine = Arc::clone(self);
        let exec_poller = spawn_poller(
            Arc::clone(&self.exec_queue),
            self.poll_interval,
            move |item| {
                let engine = Arc::clone(&engine);
                async move { engine.handle_exec_item(item).await }
            },
        );
        let mut pollers = lock(&self.pollers);
        pollers.push(trigger_poller);
        pollers.push(exec_poller);
    }

    /// Schedule cron-triggered workflows and start the scheduler.
    pub async fn start_cron(self: &Arc<Self>) -> Result<(), TriggerError> {
        let scheduler = CronScheduler::new();
        scheduler.start().await?;
        for entry in self.workflows.iter() {
            for trigger in &entry.value().config.triggers {
                let TriggerConfig::Cron { schedule } = trigger else {
                    continue;
                };
                let engine = Arc::downgrade(self);
                let workflow_id = entry.key().clone();
                scheduler
                    .add_job(schedule, move || {
                        let engine = engine.clone();
                        let workflow_id = workflow_id.clone();
                        async move {
                            let Some(engine) = engine.upgrade() else { return };
                            let event = EventInput::now(&workflow_id, EVENT_TYPE_CRON, json!({}));
                            if let Err(error) = engine.publish(event).await {
                                error!(workflow = %workflow_id, %error, "cron fire failed");
                            }
                        }
                    })
                    .await?;
            }
        }
        *lock(&self.cron) = Some(scheduler);
        Ok(())
    }

    /// Stop pollers and the cron scheduler.
    pub async fn shutdown(&self) {
        let pollers: Vec<QueuePoller> = lock(&self.pollers).drain(..).collect();
        for poller in pollers {
            poller.shutdown().await;
        }
        let cron = lock(&self.cron).take();
        if let Some(cron) = cron {
            if let Err(error) = cron.stop().await {
                warn!(%error, "cron scheduler shutdown failed");
            }
        }
    }

    /// Route one trigger event to matching workflows.
    pub async fn handle_trigger_item(&self, item: TriggerItem) {
        let event = item.event;
        if event.event_type == EVENT_TYPE_CRON {
            // Cron fires name the workflow directly.
            match self.workflow(&event.name) {
                Ok(workflow) => {
                    if let Err(error) = self.start_run(&workflow, event.clone()).await {
                        error!(workflow = %event.name, %error, "cron run start failed");
                    }
                }
                Err(error) => error!(%error, "cron fire for unregistered workflow"),
            }
            return;
        }
        for entry in self.workflows.iter() {
            let matched = entry.value().config.triggers.iter().any(|t| {
                matches!(t, TriggerConfig::Event { name } if *name == event.name)
            });
            if matched {
                if let Err(error) = self.start_run(entry.value(), event.clone()).await {
                    error!(workflow = %entry.key(), %error, "triggered run start failed");
                }
            }
        }
    }

    /// Process one exec-queue item, dropping it on failure.
    pub async fn handle_exec_item(&self, item: ExecItem) {
        let run_id = item.run_id();
        if let Err(error) = self.process_exec_item(item).await {
            error!(run_id = %run_id, %error, "dropping failed exec item");
        }
    }

    async fn process_exec_item(&self, item: ExecItem) -> Result<(), EngineError> {
        match item {
            ExecItem::Discover { run_id } => self.discover(run_id).await,
            ExecItem::SleepWake {
                run_id,
                hashed_op_id,
            } => self.sleep_wake(run_id, &hashed_op_id).await,
            ExecItem::SignalTimeout {
                run_id,
                hashed_op_id,
                signal,
            } => self.signal_timeout(run_id, &hashed_op_id, &signal).await,
            ExecItem::InvokeTimeout {
                run_id,
                hashed_op_id,
                child_run_id,
            } => self.invoke_timeout(run_id, &hashed_op_id, child_run_id).await,
        }
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    fn workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, EngineError> {
        self.workflows
            .get(workflow_id)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_id.to_string()))
    }

    async fn start_run(&self, workflow: &Workflow, event: EventInput) -> Result<Uuid, EngineError> {
        let run = Run::new(workflow.config.id.clone(), event, workflow.max_attempts());
        let run_id = run.id;
        self.store.add_run(&run).await?;
        self.enqueue_discover(run_id, Utc::now()).await?;
        info!(run_id = %run_id, workflow = %workflow.config.id, "run started");
        Ok(run_id)
    }

    async fn enqueue_discover(
        &self,
        run_id: Uuid,
        at: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.exec_queue
            .add(&ExecItem::Discover { run_id }, at)
            .await?;
        Ok(())
    }

    /// Run one tick for the run and interpret what came out.
    async fn discover(&self, run_id: Uuid) -> Result<(), EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.is_terminal() {
            debug!(run_id = %run_id, "skipping tick for finished run");
            return Ok(());
        }
        let workflow = self.workflow(&run.workflow_id)?;
        let results = driver::execute(self.store.as_ref(), &workflow, &run, None).await?;

        let mut reschedule = false;
        for result in results {
            reschedule |= self.interpret(&run, result).await?;
        }
        if reschedule {
            self.enqueue_discover(run_id, Utc::now()).await?;
        }
        Ok(())
    }

    /// Decide the next queue item for one op result. Returns whether an
    /// immediate re-discover is wanted.
    async fn interpret(&self, run: &Run, result: OpResult) -> Result<bool, EngineError> {
        let hashed = result.op_id.hashed.clone();
        match (&result.config.kind, &result.outcome) {
            (OpKind::Workflow, OpOutcome::Success { output }) => {
                self.end_run(
                    run.id,
                    RunResult::Success {
                        output: output.clone(),
                    },
                )
                .await?;
                Ok(false)
            }
            (OpKind::Workflow, OpOutcome::Error { error }) => {
                if error.can_retry {
                    let attempts = self.store.bump_op_attempt(run.id, &hashed).await?;
                    if attempts < run.max_attempts {
                        info!(run_id = %run.id, attempts, "retrying run");
                        return Ok(true);
                    }
                }
                self.end_run(
                    run.id,
                    RunResult::Error {
                        error: error.clone(),
                    },
                )
                .await?;
                Ok(false)
            }
            (OpKind::Sleep { until }, OpOutcome::Plan) => {
                self.exec_queue
                    .add(
                        &ExecItem::SleepWake {
                            run_id: run.id,
                            hashed_op_id: hashed,
                        },
                        *until,
                    )
                    .await?;
                Ok(false)
            }
            (OpKind::WaitForSignal { signal, timeout_ms }, OpOutcome::Plan) => {
                self.store
                    .push_waiting_signal(&WaitingSignal {
                        signal: signal.clone(),
                        run_id: run.id,
                        hashed_op_id: hashed.clone(),
                        registered_at: Utc::now(),
                    })
                    .await?;
                self.exec_queue
                    .add(
                        &ExecItem::SignalTimeout {
                            run_id: run.id,
                            hashed_op_id: hashed,
                            signal: signal.clone(),
                        },
                        Utc::now() + chrono::Duration::milliseconds(*timeout_ms as i64),
                    )
                    .await?;
                Ok(false)
            }
            (
                OpKind::InvokeWorkflow {
                    workflow: child_workflow_id,
                    input,
                    timeout_ms,
                },
                OpOutcome::Plan,
            ) => {
                let Ok(child_workflow) = self.workflow(child_workflow_id) else {
                    let error =
                        JsonError::internal(format!("unknown workflow '{child_workflow_id}'"));
                    self.finalize_op(run.id, &hashed, OpOutcome::Error { error }, true)
                        .await?;
                    return Ok(true);
                };
                let event =
                    EventInput::now(child_workflow_id, EVENT_TYPE_INVOKE, input.clone());
                let child = Run::new(
                    child_workflow_id.clone(),
                    event,
                    child_workflow.max_attempts(),
                );
                let child_run_id = child.id;
                self.store.add_run(&child).await?;
                self.store
                    .push_waiting_invoke(&WaitingInvoke {
                        child_run_id,
                        parent_run_id: run.id,
                        hashed_op_id: hashed.clone(),
                        registered_at: Utc::now(),
                    })
                    .await?;
                self.enqueue_discover(child_run_id, Utc::now()).await?;
                self.exec_queue
                    .add(
                        &ExecItem::InvokeTimeout {
                            run_id: run.id,
                            hashed_op_id: hashed,
                            child_run_id,
                        },
                        Utc::now() + chrono::Duration::milliseconds(*timeout_ms as i64),
                    )
                    .await?;
                info!(run_id = %run.id, child_run_id = %child_run_id, "child run invoked");
                Ok(false)
            }
            (_, OpOutcome::Success { .. }) => Ok(true),
            (_, OpOutcome::Error { error }) => {
                if !error.can_retry {
                    // The replay will observe the rejection and decide
                    // whether to surface it at workflow level.
                    return Ok(true);
                }
                let attempts = self.store.bump_op_attempt(run.id, &hashed).await?;
                if attempts >= run.max_attempts {
                    let mut exhausted = error.clone();
                    exhausted.can_retry = false;
                    self.finalize_op(run.id, &hashed, OpOutcome::Error { error: exhausted }, true)
                        .await?;
                    self.store.reset_op_attempt(run.id, &hashed).await?;
                    debug!(run_id = %run.id, op = %result.op_id.id, "op attempts exhausted");
                } else {
                    debug!(run_id = %run.id, op = %result.op_id.id, attempts, "op retry scheduled");
                }
                Ok(true)
            }
            (_, OpOutcome::Plan) => Ok(false),
        }
    }

    /// Persist the terminal result and resume a waiting parent, if any.
    async fn end_run(&self, run_id: Uuid, result: RunResult) -> Result<(), EngineError> {
        self.store.finish_run(run_id, &result).await?;
        info!(run_id = %run_id, success = matches!(result, RunResult::Success { .. }), "run finished");

        if let Some(waiting) = self.store.pop_waiting_invoke(run_id).await? {
            let outcome = match result {
                RunResult::Success { output } => OpOutcome::Success { output },
                RunResult::Error { mut error } => {
                    // A parent must not blindly retry a child's terminal
                    // failure.
                    error.can_retry = false;
                    OpOutcome::Error { error }
                }
            };
            self.finalize_op(waiting.parent_run_id, &waiting.hashed_op_id, outcome, true)
                .await?;
            self.enqueue_discover(waiting.parent_run_id, Utc::now()).await?;
        }
        Ok(())
    }

    async fn sleep_wake(&self, run_id: Uuid, hashed_op_id: &str) -> Result<(), EngineError> {
        let Some(op) = self.store.get_op(run_id, hashed_op_id).await? else {
            return Ok(());
        };
        if !op.outcome.is_plan() {
            return Ok(());
        }
        self.finalize_op(
            run_id,
            hashed_op_id,
            OpOutcome::Success { output: Value::Null },
            false,
        )
        .await?;
        self.enqueue_discover(run_id, Utc::now()).await?;
        Ok(())
    }

    async fn signal_timeout(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
        signal: &str,
    ) -> Result<(), EngineError> {
        // Stale check: the signal may have resolved the wait first.
        let Some(_) = self
            .store
            .pop_waiting_signal_for_op(run_id, hashed_op_id)
            .await?
        else {
            debug!(run_id = %run_id, signal, "signal timeout already resolved");
            return Ok(());
        };
        self.finalize_op(
            run_id,
            hashed_op_id,
            OpOutcome::Error {
                error: JsonError::signal_timeout(signal),
            },
            true,
        )
        .await?;
        self.enqueue_discover(run_id, Utc::now()).await?;
        Ok(())
    }

    async fn invoke_timeout(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
        child_run_id: Uuid,
    ) -> Result<(), EngineError> {
        // Stale check: the child may have finished first.
        let Some(waiting) = self.store.pop_waiting_invoke(child_run_id).await? else {
            debug!(run_id = %run_id, child_run_id = %child_run_id, "invoke timeout already resolved");
            return Ok(());
        };
        self.finalize_op(
            waiting.parent_run_id,
            hashed_op_id,
            OpOutcome::Error {
                error: JsonError::invoke_timeout(child_run_id),
            },
            true,
        )
        .await?;
        self.enqueue_discover(waiting.parent_run_id, Utc::now()).await?;
        Ok(())
    }

    /// Replace a stored op's outcome. Warns and skips when the op is gone.
    async fn finalize_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
        outcome: OpOutcome,
        force: bool,
    ) -> Result<bool, EngineError> {
        let Some(mut op) = self.store.get_op(run_id, hashed_op_id).await? else {
            warn!(run_id = %run_id, hashed_op_id, "op to finalize not found");
            return Ok(false);
        };
        op.outcome = outcome;
        Ok(self.store.set_op(&op, force).await?)
    }
}
