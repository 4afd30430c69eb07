//! Input validation capability.
//!
//! Concrete schema libraries stay outside the engine; a workflow plugs one
//! in through this trait. A non-empty issue list becomes a non-retryable
//! `InvalidInputError` before the workflow handler ever runs.

use serde_json::Value;
use tickflow_types::error::ValidationIssue;

/// Validates (and optionally coerces) a workflow's input payload.
pub trait InputValidator: Send + Sync {
    /// Returns the validated value, or the list of problems found.
    ///
    /// The returned value replaces the raw payload for the rest of the run,
    /// so validators may normalize or fill defaults.
    fn validate(&self, data: &Value) -> Result<Value, Vec<ValidationIssue>>;
}
