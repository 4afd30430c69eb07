//! Error types shared across the engine.
//!
//! `JsonError` is the user-facing, structurally serializable error that
//! survives persistence: an op handler failure is stored as a `JsonError`
//! and re-thrown on every subsequent replay, so `?`/match around a step
//! behaves identically to a live failure. Its `can_retry` flag is the sole
//! authority for retry eligibility across store round-trips.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Well-known error names
// ---------------------------------------------------------------------------

/// Error name for input validation failures.
pub const INVALID_INPUT_ERROR: &str = "InvalidInputError";

/// Error name for an op called from inside another op's handler.
pub const NESTED_OP_ERROR: &str = "NestedOpError";

/// Error name for a signal wait that expired before the signal arrived.
pub const SIGNAL_TIMEOUT_ERROR: &str = "SignalTimeoutError";

/// Error name for a child workflow invocation that exceeded its timeout.
pub const INVOKE_TIMEOUT_ERROR: &str = "InvokeTimeoutError";

/// Error name for internal engine failures (contract violations).
pub const INTERNAL_ERROR: &str = "InternalError";

// ---------------------------------------------------------------------------
// JsonError
// ---------------------------------------------------------------------------

/// A structurally serializable error.
///
/// Preserves name, message, an optional recursive cause chain, captured
/// stack text, and the `can_retry` flag through every persistence
/// round-trip. A thrown non-retryable error keeps `can_retry = false`
/// no matter how many times it is stored and reloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonError {
    /// Error class name (e.g. "InvalidInputError").
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional nested cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<JsonError>>,
    /// Captured stack/backtrace text, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Whether the engine may retry the failed operation.
    #[serde(default = "default_can_retry")]
    pub can_retry: bool,
}

fn default_can_retry() -> bool {
    true
}

impl JsonError {
    /// Create a retryable error with the given name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            cause: None,
            stack: None,
            can_retry: true,
        }
    }

    /// Create a non-retryable error with the given name and message.
    pub fn non_retryable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            can_retry: false,
            ..Self::new(name, message)
        }
    }

    /// Attach a cause to this error.
    pub fn with_cause(mut self, cause: JsonError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build a `JsonError` from any `std::error::Error`, walking its
    /// source chain into nested causes.
    pub fn from_error(err: &dyn std::error::Error) -> Self {
        let mut this = Self::new("Error", err.to_string());
        if let Some(source) = err.source() {
            this.cause = Some(Box::new(Self::from_error(source)));
        }
        this
    }

    /// Validation failure before the workflow handler ever runs.
    pub fn invalid_input(issues: &[ValidationIssue]) -> Self {
        let detail = issues
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Self::non_retryable(INVALID_INPUT_ERROR, format!("invalid input: {detail}"))
    }

    /// An op was triggered while another op of the same tick was executing.
    pub fn nested_op(op_id: &str) -> Self {
        Self::non_retryable(
            NESTED_OP_ERROR,
            format!("op '{op_id}' was triggered inside another op; ops cannot nest"),
        )
    }

    /// A signal wait expired without the signal arriving.
    pub fn signal_timeout(signal: &str) -> Self {
        Self::non_retryable(
            SIGNAL_TIMEOUT_ERROR,
            format!("timed out waiting for signal '{signal}'"),
        )
    }

    /// A child workflow did not finish within the invocation timeout.
    pub fn invoke_timeout(child_run_id: Uuid) -> Self {
        Self::non_retryable(
            INVOKE_TIMEOUT_ERROR,
            format!("child run {child_run_id} did not finish before the invoke timeout"),
        )
    }

    /// Internal engine failure (store/queue contract violation).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::non_retryable(INTERNAL_ERROR, message)
    }
}

impl From<anyhow::Error> for JsonError {
    fn from(err: anyhow::Error) -> Self {
        let mut this = Self::new("Error", err.to_string());
        if let Some(source) = err.source() {
            this.cause = Some(Box::new(Self::from_error(source)));
        }
        this
    }
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for JsonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Validation issues
// ---------------------------------------------------------------------------

/// A single problem reported by an input validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Path into the input document (e.g. "user.email").
    pub path: String,
    /// What was wrong at that path.
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

// ---------------------------------------------------------------------------
// Store / queue errors
// ---------------------------------------------------------------------------

/// Errors from state store operations (used by trait definitions in tickflow-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// Errors from work queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error: {0}")]
    Io(String),

    #[error("queue serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serde(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
