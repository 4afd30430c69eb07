//! Suspension gates.
//!
//! When a step op cannot resolve from the memo ledger, the workflow future
//! parks on a gate. The driver later releases the gate with the op's outcome,
//! or leaves it parked for the rest of the tick (scheduled ops awaiting an
//! external event). A shared pending counter lets the discovery loop
//! distinguish "future is blocked on parked ops" from "future is done".

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tickflow_types::error::JsonError;
use tokio::sync::oneshot;

/// Release half of a gate, held by the driver.
#[derive(Debug)]
pub struct Gate {
    tx: oneshot::Sender<Result<Value, JsonError>>,
    pending: Arc<AtomicUsize>,
}

/// Wait half of a gate, awaited inside the workflow future.
#[derive(Debug)]
pub struct GateWaiter {
    rx: oneshot::Receiver<Result<Value, JsonError>>,
}

/// Create a linked gate pair and count it against `pending`.
///
/// The count drops only on [`Gate::release`]; a gate dropped unreleased keeps
/// its op counted as parked until the tick is torn down.
pub fn gate_pair(pending: &Arc<AtomicUsize>) -> (Gate, GateWaiter) {
    pending.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    (
        Gate {
            tx,
            pending: Arc::clone(pending),
        },
        GateWaiter { rx },
    )
}

impl Gate {
    /// Deliver the op's outcome and wake the parked future.
    pub fn release(self, outcome: Result<Value, JsonError>) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        // The workflow future may already be gone (run abandoned mid-tick);
        // a lost send is fine.
        let _ = self.tx.send(outcome);
    }
}

impl GateWaiter {
    /// Await the outcome delivered by [`Gate::release`].
    ///
    /// If the gate is dropped without a release the op stays suspended
    /// forever; the tick ends around it and the whole future is dropped.
    pub async fn wait(self) -> Result<Value, JsonError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn release_delivers_outcome_and_decrements() {
        let pending = Arc::new(AtomicUsize::new(0));
        let (gate, waiter) = gate_pair(&pending);
        assert_eq!(pending.load(Ordering::SeqCst), 1);

        gate.release(Ok(json!(42)));
        assert_eq!(pending.load(Ordering::SeqCst), 0);
        assert_eq!(waiter.wait().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn error_outcome_passes_through() {
        let pending = Arc::new(AtomicUsize::new(0));
        let (gate, waiter) = gate_pair(&pending);
        gate.release(Err(JsonError::new("Error", "boom")));
        assert_eq!(waiter.wait().await.unwrap_err().message, "boom");
    }

    #[tokio::test]
    async fn dropped_gate_leaves_waiter_parked() {
        let pending = Arc::new(AtomicUsize::new(0));
        let (gate, waiter) = gate_pair(&pending);
        drop(gate);

        // Still counted as parked, and the waiter never resolves.
        assert_eq!(pending.load(Ordering::SeqCst), 1);
        assert!(waiter.wait().now_or_never().is_none());
    }
}
