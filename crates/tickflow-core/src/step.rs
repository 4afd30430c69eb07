//! The step capability set handed to workflow handlers.
//!
//! Every method assigns the op a deterministic identity, pushes it onto the
//! current tick's discovery batch, and suspends the caller on a gate until
//! the driver classifies the batch. Already-memoized ops resume with their
//! stored outcome; new immediate ops resume after inline execution; scheduled
//! ops stay parked until a queue wakeup resolves them in a later tick.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tickflow_types::error::JsonError;
use tickflow_types::op::{OpConfig, OpId};

use crate::gate::{Gate, gate_pair};
use crate::ident::OpIdFactory;
use crate::validate::InputValidator;

/// Error name for op outputs that fail JSON conversion.
pub const SERIALIZATION_ERROR: &str = "SerializationError";

/// A deferred immediate-op handler, run at most once per attempt.
pub type BoxedOpHandler =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, JsonError>> + Send>;

// ---------------------------------------------------------------------------
// Tick state
// ---------------------------------------------------------------------------

/// Mutable state shared between the step handle and the discovery loop for
/// the duration of one tick.
#[derive(Default)]
pub(crate) struct TickState {
    pub(crate) batch: Vec<FoundOp>,
    pub(crate) ids: OpIdFactory,
}

pub(crate) type TickStateHandle = Arc<Mutex<TickState>>;

pub(crate) fn lock_state(state: &TickStateHandle) -> MutexGuard<'_, TickState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An op discovered during the current tick, not yet classified.
pub struct FoundOp {
    pub config: OpConfig,
    pub op_id: OpId,
    pub(crate) handler: Option<BoxedOpHandler>,
    pub(crate) gate: Gate,
    pub(crate) executing: Arc<AtomicBool>,
}

impl FoundOp {
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Resume the workflow future with a memoized outcome.
    pub(crate) fn release(self, outcome: Result<Value, JsonError>) {
        self.gate.release(outcome);
    }
}

impl std::fmt::Debug for FoundOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoundOp")
            .field("op_id", &self.op_id)
            .field("config", &self.config)
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Options and payloads
// ---------------------------------------------------------------------------

/// Options for [`Step::wait_for_signal`].
#[derive(Clone)]
pub struct SignalOpts {
    pub signal: String,
    pub timeout: Duration,
    /// Optional payload validator. `None` passes payloads through as-is.
    pub schema: Option<Arc<dyn InputValidator>>,
}

impl SignalOpts {
    pub fn new(signal: impl Into<String>, timeout: Duration) -> Self {
        Self {
            signal: signal.into(),
            timeout,
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: Arc<dyn InputValidator>) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl std::fmt::Debug for SignalOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalOpts")
            .field("signal", &self.signal)
            .field("timeout", &self.timeout)
            .field("has_schema", &self.schema.is_some())
            .finish()
    }
}

/// What a resolved signal wait returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub data: Value,
    pub signal: String,
}

/// Options for [`Step::invoke_workflow`].
#[derive(Debug, Clone)]
pub struct InvokeOpts {
    pub workflow: String,
    pub input: Value,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// The capability handle workflow code calls ops through.
///
/// Cheap to clone; clones share the same tick.
#[derive(Clone)]
pub struct Step {
    state: TickStateHandle,
    pending: Arc<AtomicUsize>,
    executing: Arc<AtomicBool>,
}

impl Step {
    pub(crate) fn new(
        state: TickStateHandle,
        pending: Arc<AtomicUsize>,
        executing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state,
            pending,
            executing,
        }
    }

    /// Run a unit of work at most once for this op identity.
    ///
    /// On replay the memoized output (or error) is returned without calling
    /// `f` again.
    pub async fn run<T, F, Fut>(&self, id: &str, f: F) -> Result<T, JsonError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, JsonError>> + Send + 'static,
    {
        let handler: BoxedOpHandler = Box::new(move || {
            Box::pin(async move {
                let output = f().await?;
                serde_json::to_value(output)
                    .map_err(|e| JsonError::non_retryable(SERIALIZATION_ERROR, e.to_string()))
            })
        });
        let value = self.push_op(id, OpConfig::run(), Some(handler)).await?;
        serde_json::from_value(value)
            .map_err(|e| JsonError::non_retryable(SERIALIZATION_ERROR, e.to_string()))
    }

    /// Suspend the run for a duration of wall-clock time.
    pub async fn sleep(&self, id: &str, duration: Duration) -> Result<(), JsonError> {
        let until = Utc::now() + chrono::Duration::milliseconds(duration.as_millis() as i64);
        self.sleep_until(id, until).await
    }

    /// Suspend the run until a wall-clock instant.
    pub async fn sleep_until(&self, id: &str, until: DateTime<Utc>) -> Result<(), JsonError> {
        self.push_op(id, OpConfig::sleep(until), None).await?;
        Ok(())
    }

    /// Suspend until an external signal arrives, or fail with a
    /// `SignalTimeoutError` when the timeout fires first.
    ///
    /// When `opts.schema` is set, the delivered payload runs through it on
    /// every replay; a rejection becomes a non-retryable
    /// `InvalidInputError`.
    pub async fn wait_for_signal(
        &self,
        id: &str,
        opts: SignalOpts,
    ) -> Result<SignalPayload, JsonError> {
        let SignalOpts {
            signal,
            timeout,
            schema,
        } = opts;
        let config = OpConfig::wait_for_signal(signal, timeout.as_millis() as u64);
        let value = self.push_op(id, config, None).await?;
        let mut payload: SignalPayload = serde_json::from_value(value)
            .map_err(|e| JsonError::non_retryable(SERIALIZATION_ERROR, e.to_string()))?;
        if let Some(schema) = schema {
            payload.data = schema
                .validate(&payload.data)
                .map_err(|issues| JsonError::invalid_input(&issues))?;
        }
        Ok(payload)
    }

    /// Start a child run and suspend until it finishes, or fail with an
    /// `InvokeTimeoutError` when the timeout fires first.
    pub async fn invoke_workflow(&self, id: &str, opts: InvokeOpts) -> Result<Value, JsonError> {
        let config =
            OpConfig::invoke_workflow(opts.workflow, opts.input, opts.timeout.as_millis() as u64);
        self.push_op(id, config, None).await
    }

    async fn push_op(
        &self,
        id: &str,
        config: OpConfig,
        handler: Option<BoxedOpHandler>,
    ) -> Result<Value, JsonError> {
        // Ops cannot nest: an op triggered while another op of the same tick
        // is executing is a programming error, never retried.
        if self.executing.load(Ordering::SeqCst) {
            return Err(JsonError::nested_op(id));
        }
        let waiter = {
            let mut state = lock_state(&self.state);
            let op_id = state.ids.next(id);
            let (gate, waiter) = gate_pair(&self.pending);
            state.batch.push(FoundOp {
                config,
                op_id,
                handler,
                gate,
                executing: Arc::clone(&self.executing),
            });
            waiter
        };
        waiter.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    fn test_step() -> (Step, TickStateHandle, Arc<AtomicUsize>) {
        let state: TickStateHandle = Arc::new(Mutex::new(TickState::default()));
        let pending = Arc::new(AtomicUsize::new(0));
        let executing = Arc::new(AtomicBool::new(false));
        let step = Step::new(Arc::clone(&state), Arc::clone(&pending), executing);
        (step, state, pending)
    }

    #[tokio::test]
    async fn run_pushes_an_immediate_op_and_parks() {
        let (step, state, pending) = test_step();

        let mut fut = Box::pin(step.run::<i64, _, _>("add", || async { Ok(41 + 1) }));
        assert!(fut.as_mut().now_or_never().is_none());
        assert_eq!(pending.load(Ordering::SeqCst), 1);

        let mut batch = std::mem::take(&mut lock_state(&state).batch);
        assert_eq!(batch.len(), 1);
        let found = batch.remove(0);
        assert_eq!(found.op_id.id, "add");
        assert!(found.has_handler());

        found.release(Ok(json!(42)));
        assert_eq!(fut.now_or_never().unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn scheduled_ops_carry_no_handler() {
        let (step, state, _pending) = test_step();

        let fut = step.sleep("nap", Duration::from_millis(500));
        assert!(Box::pin(fut).as_mut().now_or_never().is_none());

        let batch = &lock_state(&state).batch;
        assert_eq!(batch.len(), 1);
        assert!(!batch[0].has_handler());
        assert_eq!(batch[0].config.kind_label(), "sleep");
    }

    #[tokio::test]
    async fn nested_op_is_rejected() {
        let (step, _state, _pending) = test_step();
        step.executing.store(true, Ordering::SeqCst);

        let err = step
            .run::<i64, _, _>("inner", || async { Ok(1) })
            .await
            .unwrap_err();
        assert!(!err.can_retry);
        assert!(err.name.contains("NestedOp"));
    }

    #[tokio::test]
    async fn duplicate_ids_index_in_call_order() {
        let (step, state, _pending) = test_step();

        let _a = Box::pin(step.run::<i64, _, _>("poll", || async { Ok(1) }))
            .as_mut()
            .now_or_never();
        let _b = Box::pin(step.run::<i64, _, _>("poll", || async { Ok(2) }))
            .as_mut()
            .now_or_never();

        let batch = &lock_state(&state).batch;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].op_id.index, 0);
        assert_eq!(batch[1].op_id.index, 1);
        assert_ne!(batch[0].op_id.hashed, batch[1].op_id.hashed);
    }
}
