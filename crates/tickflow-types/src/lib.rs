//! Shared domain types for the tickflow workflow engine.
//!
//! This crate contains the data model every other layer agrees on: runs,
//! operations, trigger events, queue items, the serializable error shape,
//! and the wire protocol for the per-step checkpoint backend.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod op;
pub mod queue;
pub mod run;
pub mod wire;
pub mod workflow;
