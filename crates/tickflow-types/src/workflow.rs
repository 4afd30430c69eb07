//! Workflow configuration.
//!
//! The handler itself lives in `tickflow-core` (it is a function, not data);
//! this module holds the declarative part that stores and registries agree on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::TriggerConfig;

/// Declarative configuration of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Unique workflow id (e.g. "billing/charge-customer").
    pub id: String,
    /// Schema document handed to an external input validator, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Attempt budget for ops and the workflow-level result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// How runs of this workflow are started.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

impl WorkflowConfig {
    /// Minimal config: id only, no schema, default attempts, no triggers.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input_schema: None,
            max_attempts: None,
            triggers: Vec::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.push(trigger);
        self
    }
}
