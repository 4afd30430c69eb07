//! In-memory store and queue: the canonical single-process backend.
//!
//! Runs and ops live in concurrent maps; the registries and the queue use a
//! plain mutex since their critical sections are tiny and never held across
//! an await.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tickflow_types::error::{QueueError, StoreError};
use tickflow_types::op::OpResult;
use tickflow_types::run::{Run, RunResult, WaitingInvoke, WaitingSignal};
use uuid::Uuid;

use crate::queue::WorkQueue;
use crate::store::StateStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    runs: DashMap<Uuid, Run>,
    ops: DashMap<(Uuid, String), OpResult>,
    waiting_signals: Mutex<Vec<WaitingSignal>>,
    waiting_invokes: DashMap<Uuid, WaitingInvoke>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    async fn add_run(&self, run: &Run) -> Result<(), StoreError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn finish_run(&self, run_id: Uuid, result: &RunResult) -> Result<(), StoreError> {
        let mut run = self.runs.get_mut(&run_id).ok_or(StoreError::NotFound)?;
        run.result = Some(result.clone());
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn bump_op_attempt(&self, run_id: Uuid, hashed_op_id: &str) -> Result<u32, StoreError> {
        let mut run = self.runs.get_mut(&run_id).ok_or(StoreError::NotFound)?;
        let attempts = run.op_attempts.entry(hashed_op_id.to_string()).or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    async fn reset_op_attempt(&self, run_id: Uuid, hashed_op_id: &str) -> Result<(), StoreError> {
        let mut run = self.runs.get_mut(&run_id).ok_or(StoreError::NotFound)?;
        run.op_attempts.insert(hashed_op_id.to_string(), 1);
        Ok(())
    }

    async fn get_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> Result<Option<OpResult>, StoreError> {
        let key = (run_id, hashed_op_id.to_string());
        Ok(self.ops.get(&key).map(|op| op.clone()))
    }

    async fn set_op(&self, op: &OpResult, force: bool) -> Result<bool, StoreError> {
        let key = (op.run_id, op.op_id.hashed.clone());
        let mut entry = self.ops.entry(key).or_insert_with(|| op.clone());
        if entry.value() != op {
            if entry.value().outcome.is_settled() && !force {
                return Ok(false);
            }
            *entry.value_mut() = op.clone();
        }
        Ok(true)
    }

    async fn list_ops(&self, run_id: Uuid) -> Result<Vec<OpResult>, StoreError> {
        Ok(self
            .ops
            .iter()
            .filter(|entry| entry.key().0 == run_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn push_waiting_signal(&self, waiting: &WaitingSignal) -> Result<(), StoreError> {
        lock(&self.waiting_signals).push(waiting.clone());
        Ok(())
    }

    async fn pop_waiting_signal(&self, signal: &str) -> Result<Option<WaitingSignal>, StoreError> {
        let mut signals = lock(&self.waiting_signals);
        let position = signals.iter().position(|w| w.signal == signal);
        Ok(position.map(|i| signals.remove(i)))
    }

    async fn pop_waiting_signal_for_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> Result<Option<WaitingSignal>, StoreError> {
        let mut signals = lock(&self.waiting_signals);
        let position = signals
            .iter()
            .position(|w| w.run_id == run_id && w.hashed_op_id == hashed_op_id);
        Ok(position.map(|i| signals.remove(i)))
    }

    async fn push_waiting_invoke(&self, waiting: &WaitingInvoke) -> Result<(), StoreError> {
        self.waiting_invokes
            .insert(waiting.child_run_id, waiting.clone());
        Ok(())
    }

    async fn pop_waiting_invoke(
        &self,
        child_run_id: Uuid,
    ) -> Result<Option<WaitingInvoke>, StoreError> {
        Ok(self
            .waiting_invokes
            .remove(&child_run_id)
            .map(|(_, waiting)| waiting))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// In-memory [`WorkQueue`], ordered by `(run_at, insertion uuid)`.
#[derive(Debug)]
pub struct MemoryWorkQueue<T> {
    items: Mutex<BTreeMap<(DateTime<Utc>, Uuid), T>>,
}

impl<T> MemoryWorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> Default for MemoryWorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> WorkQueue<T> for MemoryWorkQueue<T> {
    async fn add(&self, item: &T, run_at: DateTime<Utc>) -> Result<(), QueueError> {
        lock(&self.items).insert((run_at, Uuid::now_v7()), item.clone());
        Ok(())
    }

    async fn get_next(&self) -> Result<Option<T>, QueueError> {
        let mut items = lock(&self.items);
        let due = items
            .first_key_value()
            .filter(|((run_at, _), _)| *run_at <= Utc::now())
            .map(|(key, _)| *key);
        Ok(due.and_then(|key| items.remove(&key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tickflow_types::error::JsonError;
    use tickflow_types::event::{EVENT_TYPE_START, EventInput};
    use tickflow_types::op::{OpConfig, OpId, OpOutcome};
    use tickflow_types::run::DEFAULT_MAX_ATTEMPTS;

    fn sample_run() -> Run {
        Run::new(
            "billing",
            EventInput::now("billing", EVENT_TYPE_START, json!({})),
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    fn sample_op(run_id: Uuid, hashed: &str, outcome: OpOutcome) -> OpResult {
        OpResult {
            config: OpConfig::run(),
            op_id: OpId {
                hashed: hashed.to_string(),
                id: "step".to_string(),
                index: 0,
            },
            outcome,
            run_id,
            workflow_id: "billing".to_string(),
        }
    }

    #[tokio::test]
    async fn settled_op_is_not_overwritten_without_force() {
        let store = MemoryStateStore::new();
        let run = sample_run();
        store.add_run(&run).await.unwrap();

        let success = sample_op(run.id, "abc", OpOutcome::Success { output: json!(1) });
        assert!(store.set_op(&success, false).await.unwrap());

        let overwrite = sample_op(run.id, "abc", OpOutcome::Success { output: json!(2) });
        assert!(!store.set_op(&overwrite, false).await.unwrap());
        let stored = store.get_op(run.id, "abc").await.unwrap().unwrap();
        assert_eq!(stored.outcome, OpOutcome::Success { output: json!(1) });

        // A forced write applies (timeout finalization path).
        assert!(store.set_op(&overwrite, true).await.unwrap());
    }

    #[tokio::test]
    async fn plan_and_retryable_error_are_overwritable() {
        let store = MemoryStateStore::new();
        let run = sample_run();
        store.add_run(&run).await.unwrap();

        let plan = sample_op(run.id, "abc", OpOutcome::Plan);
        store.set_op(&plan, false).await.unwrap();
        let retryable = sample_op(
            run.id,
            "abc",
            OpOutcome::Error {
                error: JsonError::new("Error", "transient"),
            },
        );
        assert!(store.set_op(&retryable, false).await.unwrap());
        let success = sample_op(run.id, "abc", OpOutcome::Success { output: json!(1) });
        assert!(store.set_op(&success, false).await.unwrap());
    }

    #[tokio::test]
    async fn attempt_counters_bump_and_reset() {
        let store = MemoryStateStore::new();
        let run = sample_run();
        store.add_run(&run).await.unwrap();

        assert_eq!(store.bump_op_attempt(run.id, "abc").await.unwrap(), 1);
        assert_eq!(store.bump_op_attempt(run.id, "abc").await.unwrap(), 2);
        store.reset_op_attempt(run.id, "abc").await.unwrap();
        assert_eq!(store.bump_op_attempt(run.id, "abc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn waiting_signal_pops_once() {
        let store = MemoryStateStore::new();
        let waiting = WaitingSignal {
            signal: "go".to_string(),
            run_id: Uuid::now_v7(),
            hashed_op_id: "abc".to_string(),
            registered_at: Utc::now(),
        };
        store.push_waiting_signal(&waiting).await.unwrap();

        assert!(store.pop_waiting_signal("go").await.unwrap().is_some());
        assert!(store.pop_waiting_signal("go").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signal_pop_is_fifo_per_name() {
        let store = MemoryStateStore::new();
        let first_run = Uuid::now_v7();
        let second_run = Uuid::now_v7();
        for run_id in [first_run, second_run] {
            store
                .push_waiting_signal(&WaitingSignal {
                    signal: "go".to_string(),
                    run_id,
                    hashed_op_id: "abc".to_string(),
                    registered_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let popped = store.pop_waiting_signal("go").await.unwrap().unwrap();
        assert_eq!(popped.run_id, first_run);
    }

    #[tokio::test]
    async fn queue_orders_by_time() {
        let queue = MemoryWorkQueue::<&'static str>::new();
        let now = Utc::now();
        queue.add(&"later", now + chrono::Duration::hours(1)).await.unwrap();
        queue.add(&"second", now - chrono::Duration::seconds(1)).await.unwrap();
        queue.add(&"first", now - chrono::Duration::seconds(2)).await.unwrap();

        assert_eq!(queue.get_next().await.unwrap(), Some("first"));
        assert_eq!(queue.get_next().await.unwrap(), Some("second"));
        assert_eq!(queue.get_next().await.unwrap(), None);
    }
}
