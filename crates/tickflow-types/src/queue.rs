//! Work queue item types.
//!
//! Two queues drive the engine: the event queue carries incoming trigger
//! events, and the exec queue carries per-run work (discovery ticks, sleep
//! wakeups, signal/invoke timeouts). Items are serialized so durable queue
//! backends can persist them as-is.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventInput;

/// An incoming trigger event awaiting routing to matching workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerItem {
    pub event: EventInput,
}

/// One unit of scheduled execution work for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecItem {
    /// Replay the workflow function for one tick.
    Discover { run_id: Uuid },
    /// A sleep op's wake time has passed; finalize it and re-discover.
    SleepWake { run_id: Uuid, hashed_op_id: String },
    /// A signal wait may have expired; fires only if the wait is still registered.
    SignalTimeout {
        run_id: Uuid,
        hashed_op_id: String,
        signal: String,
    },
    /// A child invocation may have expired; fires only if the wait is still registered.
    InvokeTimeout {
        run_id: Uuid,
        hashed_op_id: String,
        child_run_id: Uuid,
    },
}

impl ExecItem {
    /// The run this item belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            ExecItem::Discover { run_id }
            | ExecItem::SleepWake { run_id, .. }
            | ExecItem::SignalTimeout { run_id, .. }
            | ExecItem::InvokeTimeout { run_id, .. } => *run_id,
        }
    }
}
