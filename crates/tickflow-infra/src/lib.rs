//! Durable backends for the tickflow engine.
//!
//! Implements the `StateStore` and `WorkQueue` contracts from
//! `tickflow-core` twice over: a filesystem layout of JSON documents with
//! atomic rename writes, and SQLite via sqlx with a split reader/writer
//! pool in WAL mode.

pub mod fs;
pub mod sqlite;
