//! Filesystem [`WorkQueue`] implementation.
//!
//! One file per queued item, named `{run_at_millis:020}-{uuid}.json` so a
//! plain name sort is delivery order. A dequeue claims its item by renaming
//! it to a `.claim` path first; when two pollers race, the loser's rename
//! fails and it moves on to the next candidate.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tickflow_core::queue::WorkQueue;
use tickflow_types::error::QueueError;
use tracing::debug;
use uuid::Uuid;

use super::write_json_atomic;

fn io_err(e: std::io::Error) -> QueueError {
    QueueError::Io(e.to_string())
}

/// [`WorkQueue`] over a directory of one-file-per-item JSON documents.
pub struct FsWorkQueue<T> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FsWorkQueue<T> {
    /// Queue items under `{root}/queues/{name}/`.
    pub fn new(root: impl AsRef<Path>, name: &str) -> Self {
        Self {
            dir: root.as_ref().join("queues").join(name),
            _marker: PhantomData,
        }
    }
}

/// Millis-since-epoch prefix of an item file name, if it has one.
fn due_millis(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(".json")?;
    let (millis, _) = stem.split_once('-')?;
    millis.parse().ok()
}

impl<T> WorkQueue<T> for FsWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn add(&self, item: &T, run_at: DateTime<Utc>) -> Result<(), QueueError> {
        let name = format!("{:020}-{}.json", run_at.timestamp_millis(), Uuid::now_v7());
        write_json_atomic(&self.dir.join(name), item)
            .await
            .map_err(io_err)
    }

    async fn get_next(&self) -> Result<Option<T>, QueueError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };

        let now = Utc::now().timestamp_millis();
        let mut due = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if due_millis(name).is_some_and(|millis| millis <= now) {
                due.push(name.to_string());
            }
        }
        due.sort();

        for name in due {
            let path = self.dir.join(&name);
            let claimed = self.dir.join(format!("{name}.claim"));
            match tokio::fs::rename(&path, &claimed).await {
                Ok(()) => {}
                // Another poller got here first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(e)),
            }
            let bytes = tokio::fs::read(&claimed).await.map_err(io_err)?;
            let item = serde_json::from_slice(&bytes)?;
            tokio::fs::remove_file(&claimed).await.map_err(io_err)?;
            debug!(item = %name, "queue item claimed");
            return Ok(Some(item));
        }
        Ok(None)
    }
}
