//! Filesystem [`StateStore`] implementation.

use std::path::{Path, PathBuf};

use tickflow_core::store::StateStore;
use tickflow_types::error::StoreError;
use tickflow_types::op::OpResult;
use tickflow_types::run::{Run, RunResult, WaitingInvoke, WaitingSignal};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{read_json, write_json_atomic};

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

/// [`StateStore`] rooted at a data directory.
///
/// Read-modify-write sequences (attempt counters, the settled-op guard, the
/// signal lists) are serialized through one in-process mutex; documents are
/// replaced atomically so readers outside the lock still see whole values.
pub struct FsStateStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    fn ops_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("ops").join(run_id.to_string())
    }

    fn op_path(&self, run_id: Uuid, hashed_op_id: &str) -> PathBuf {
        self.ops_dir(run_id).join(format!("{hashed_op_id}.json"))
    }

    fn signal_path(&self, signal: &str) -> PathBuf {
        self.root.join("signals").join(format!("{signal}.json"))
    }

    fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    fn invoke_path(&self, child_run_id: Uuid) -> PathBuf {
        self.root
            .join("invokes")
            .join(format!("{child_run_id}.json"))
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        read_json(&self.run_path(run_id))
            .await
            .map_err(io_err)?
            .ok_or(StoreError::NotFound)
    }

    async fn store_run(&self, run: &Run) -> Result<(), StoreError> {
        write_json_atomic(&self.run_path(run.id), run)
            .await
            .map_err(io_err)
    }

    async fn load_signal_list(&self, path: &Path) -> Result<Vec<WaitingSignal>, StoreError> {
        Ok(read_json(path).await.map_err(io_err)?.unwrap_or_default())
    }
}

impl StateStore for FsStateStore {
    async fn add_run(&self, run: &Run) -> Result<(), StoreError> {
        self.store_run(run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        read_json(&self.run_path(run_id)).await.map_err(io_err)
    }

    async fn finish_run(&self, run_id: Uuid, result: &RunResult) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load_run(run_id).await?;
        run.result = Some(result.clone());
        run.completed_at = Some(chrono::Utc::now());
        self.store_run(&run).await
    }

    async fn bump_op_attempt(&self, run_id: Uuid, hashed_op_id: &str) -> Result<u32, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load_run(run_id).await?;
        let attempts = run.op_attempts.entry(hashed_op_id.to_string()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        self.store_run(&run).await?;
        Ok(attempts)
    }

    async fn reset_op_attempt(&self, run_id: Uuid, hashed_op_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load_run(run_id).await?;
        run.op_attempts.insert(hashed_op_id.to_string(), 1);
        self.store_run(&run).await
    }

    async fn get_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> Result<Option<OpResult>, StoreError> {
        read_json(&self.op_path(run_id, hashed_op_id))
            .await
            .map_err(io_err)
    }

    async fn set_op(&self, op: &OpResult, force: bool) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.op_path(op.run_id, &op.op_id.hashed);
        if let Some(existing) = read_json::<OpResult>(&path).await.map_err(io_err)? {
            if existing == *op {
                return Ok(true);
            }
            if existing.outcome.is_settled() && !force {
                warn!(
                    run_id = %op.run_id,
                    hashed_op_id = %op.op_id.hashed,
                    "write to settled op blocked"
                );
                return Ok(false);
            }
        }
        write_json_atomic(&path, op).await.map_err(io_err)?;
        Ok(true)
    }

    async fn list_ops(&self, run_id: Uuid) -> Result<Vec<OpResult>, StoreError> {
        let dir = self.ops_dir(run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        let mut ops = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(op) = read_json(&path).await.map_err(io_err)? {
                    ops.push(op);
                }
            }
        }
        Ok(ops)
    }

    async fn push_waiting_signal(&self, waiting: &WaitingSignal) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.signal_path(&waiting.signal);
        let mut list = self.load_signal_list(&path).await?;
        list.push(waiting.clone());
        write_json_atomic(&path, &list).await.map_err(io_err)
    }

    async fn pop_waiting_signal(&self, signal: &str) -> Result<Option<WaitingSignal>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.signal_path(signal);
        let mut list = self.load_signal_list(&path).await?;
        if list.is_empty() {
            return Ok(None);
        }
        let waiting = list.remove(0);
        write_json_atomic(&path, &list).await.map_err(io_err)?;
        Ok(Some(waiting))
    }

    async fn pop_waiting_signal_for_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> Result<Option<WaitingSignal>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = match tokio::fs::read_dir(self.signals_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let mut list = self.load_signal_list(&path).await?;
            if let Some(position) = list
                .iter()
                .position(|w| w.run_id == run_id && w.hashed_op_id == hashed_op_id)
            {
                let waiting = list.remove(position);
                write_json_atomic(&path, &list).await.map_err(io_err)?;
                return Ok(Some(waiting));
            }
        }
        Ok(None)
    }

    async fn push_waiting_invoke(&self, waiting: &WaitingInvoke) -> Result<(), StoreError> {
        write_json_atomic(&self.invoke_path(waiting.child_run_id), waiting)
            .await
            .map_err(io_err)
    }

    async fn pop_waiting_invoke(
        &self,
        child_run_id: Uuid,
    ) -> Result<Option<WaitingInvoke>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.invoke_path(child_run_id);
        let Some(waiting) = read_json::<WaitingInvoke>(&path).await.map_err(io_err)? else {
            return Ok(None);
        };
        tokio::fs::remove_file(&path).await.map_err(io_err)?;
        Ok(Some(waiting))
    }
}
