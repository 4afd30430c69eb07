//! Workflow definitions: configuration plus the async handler.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tickflow_types::error::JsonError;
use tickflow_types::event::EventInput;
use tickflow_types::run::DEFAULT_MAX_ATTEMPTS;
use tickflow_types::workflow::WorkflowConfig;
use uuid::Uuid;

use crate::step::Step;
use crate::validate::InputValidator;

/// Context handed to a workflow handler on every replay.
#[derive(Debug, Clone)]
pub struct WorkflowCtx {
    pub run_id: Uuid,
    pub workflow_id: String,
    /// The trigger event, as `ctx.input` for the handler.
    pub input: EventInput,
}

/// The replayed body of a workflow.
///
/// Must be deterministic over the memo ledger: same input and same stored
/// op outcomes must drive the same sequence of step calls.
pub type WorkflowHandler =
    dyn Fn(WorkflowCtx, Step) -> BoxFuture<'static, Result<Value, JsonError>> + Send + Sync;

/// A registered workflow definition: config, handler, optional validator.
#[derive(Clone)]
pub struct Workflow {
    pub config: WorkflowConfig,
    handler: Arc<WorkflowHandler>,
    validator: Option<Arc<dyn InputValidator>>,
}

impl Workflow {
    pub fn new<F, Fut>(config: WorkflowConfig, handler: F) -> Self
    where
        F: Fn(WorkflowCtx, Step) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, JsonError>> + Send + 'static,
    {
        Self {
            config,
            handler: Arc::new(move |ctx, step| Box::pin(handler(ctx, step))),
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Effective attempt budget for this workflow's runs.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub(crate) fn call(
        &self,
        ctx: WorkflowCtx,
        step: Step,
    ) -> BoxFuture<'static, Result<Value, JsonError>> {
        (self.handler)(ctx, step)
    }

    pub(crate) fn validator(&self) -> Option<&Arc<dyn InputValidator>> {
        self.validator.as_ref()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("config", &self.config)
            .field("has_validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}
