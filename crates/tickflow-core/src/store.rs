//! The state-store contract every backend satisfies.
//!
//! One store is authoritative per run. Backends live in `tickflow-infra`
//! (filesystem, SQLite); the in-memory backend in [`crate::memory`] is the
//! canonical single-process implementation and the test backend.

use tickflow_types::error::StoreError;
use tickflow_types::op::OpResult;
use tickflow_types::run::{Run, RunResult, WaitingInvoke, WaitingSignal};
use uuid::Uuid;

/// Run bookkeeping, the idempotent op ledger, attempt counters, and the
/// waiting-signal / waiting-invoke registries.
///
/// Contract notes:
/// - `set_op` never overwrites a settled result unless `force` is set; a
///   plan or retryable error is always overwritable. Returns whether the
///   write happened.
/// - The `pop_*` registry methods must remove atomically: two concurrent
///   poppers for the same entry must not both receive it.
pub trait StateStore: Send + Sync + 'static {
    fn add_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_run(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, StoreError>> + Send;

    /// Persist the terminal result and completion time. A run with a result
    /// is immutable afterwards.
    fn finish_run(
        &self,
        run_id: Uuid,
        result: &RunResult,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Increment the attempt counter for an op and return the new count.
    fn bump_op_attempt(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> impl std::future::Future<Output = Result<u32, StoreError>> + Send;

    /// Reset the attempt counter to 1 (applied when step-level attempts are
    /// exhausted and the rejection is surfaced to the workflow body).
    fn reset_op_attempt(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<OpResult>, StoreError>> + Send;

    /// Write an op result. Returns `false` when an already-settled result
    /// blocked the write (and `force` was not set).
    fn set_op(
        &self,
        op: &OpResult,
        force: bool,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    fn list_ops(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<OpResult>, StoreError>> + Send;

    fn push_waiting_signal(
        &self,
        waiting: &WaitingSignal,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Pop the oldest wait registered for this signal name.
    fn pop_waiting_signal(
        &self,
        signal: &str,
    ) -> impl std::future::Future<Output = Result<Option<WaitingSignal>, StoreError>> + Send;

    /// Pop the wait registered by a specific run/op, if still present.
    /// Used by the timeout path's stale pre-check.
    fn pop_waiting_signal_for_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WaitingSignal>, StoreError>> + Send;

    fn push_waiting_invoke(
        &self,
        waiting: &WaitingInvoke,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Pop the wait registered for this child run, if still present.
    fn pop_waiting_invoke(
        &self,
        child_run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WaitingInvoke>, StoreError>> + Send;
}
