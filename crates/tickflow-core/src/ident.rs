//! Deterministic op identity.
//!
//! Replay correctness hinges on an op resolving to the same storage key on
//! every pass: the key is a SHA-256 of the human-assigned id plus its
//! occurrence index within the run. Loops reuse an id safely because each
//! occurrence gets the next index.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tickflow_types::op::OpId;

/// Reserved op id for the synthesized workflow-level result.
pub const WORKFLOW_OP_ID: &str = "$workflow";

/// Hash an op id and occurrence index into the durable storage key.
pub fn hash_op_id(id: &str, index: u32) -> String {
    format!("{:x}", Sha256::digest(format!("{id}:{index}")))
}

/// Assigns occurrence indexes to op ids in discovery order.
///
/// One factory lives for exactly one tick; replaying from the top with a
/// fresh factory reproduces the same `(id, index)` pairs, and therefore the
/// same hashes, as every earlier tick.
#[derive(Debug, Default)]
pub struct OpIdFactory {
    counters: HashMap<String, u32>,
}

impl OpIdFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the identity for the next occurrence of `id`.
    pub fn next(&mut self, id: &str) -> OpId {
        let counter = self.counters.entry(id.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;
        OpId {
            hashed: hash_op_id(id, index),
            id: id.to_string(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_op_id("charge", 0), hash_op_id("charge", 0));
        assert_ne!(hash_op_id("charge", 0), hash_op_id("charge", 1));
        assert_ne!(hash_op_id("charge", 0), hash_op_id("refund", 0));
    }

    #[test]
    fn duplicate_ids_get_distinct_indexes() {
        let mut factory = OpIdFactory::new();
        let first = factory.next("poll");
        let second = factory.next("poll");
        let other = factory.next("notify");

        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_ne!(first.hashed, second.hashed);
        assert_eq!(other.index, 0);
    }

    #[test]
    fn fresh_factory_reproduces_identities() {
        let mut a = OpIdFactory::new();
        let mut b = OpIdFactory::new();
        for id in ["x", "y", "x", "x", "y"] {
            assert_eq!(a.next(id), b.next(id));
        }
    }
}
