//! Filesystem backend.
//!
//! Everything is a JSON document under one data directory:
//!
//! ```text
//! {root}/runs/{run_id}.json
//! {root}/ops/{run_id}/{hashed_op_id}.json
//! {root}/signals/{signal}.json          (FIFO list of waiting ops)
//! {root}/invokes/{child_run_id}.json
//! {root}/queues/{queue}/{millis:020}-{uuid}.json
//! ```
//!
//! Writes go to a temporary sibling and are renamed into place, so a reader
//! never observes a half-written document. Queue dequeues claim items by
//! rename, which also makes them safe against a concurrent poller.

pub mod queue;
pub mod store;

pub use queue::FsWorkQueue;
pub use store::FsStateStore;

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Serialize `value` and atomically replace `path` with it.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::now_v7()));
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read and deserialize a JSON document; a missing file is `None`.
pub(crate) async fn read_json<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, std::io::Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
