//! SQLite [`StateStore`] implementation.
//!
//! Runs and op results are stored as JSON blobs next to the columns the
//! queries filter on. Registry pops and the settled-op guard ride on the
//! single-connection writer pool, which serializes them without row locks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tickflow_core::store::StateStore;
use tickflow_types::error::StoreError;
use tickflow_types::op::OpResult;
use tickflow_types::run::{Run, RunCtx, RunResult, WaitingInvoke, WaitingSignal};
use tracing::warn;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_id: String,
    ctx: String,
    max_attempts: i64,
    op_attempts: String,
    result: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            ctx: row.try_get("ctx")?,
            max_attempts: row.try_get("max_attempts")?,
            op_attempts: row.try_get("op_attempts")?,
            result: row.try_get("result")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        let ctx: RunCtx = serde_json::from_str(&self.ctx)
            .map_err(|e| StoreError::Query(format!("invalid run ctx JSON: {e}")))?;
        let op_attempts: HashMap<String, u32> = serde_json::from_str(&self.op_attempts)
            .map_err(|e| StoreError::Query(format!("invalid op_attempts JSON: {e}")))?;
        let result = self
            .result
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| StoreError::Query(format!("invalid run result JSON: {e}")))
            })
            .transpose()?;

        Ok(Run {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            ctx,
            max_attempts: self.max_attempts as u32,
            op_attempts,
            result,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

fn signal_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WaitingSignal, StoreError> {
    let run_id: String = row.try_get("run_id").map_err(query_err)?;
    let registered_at: String = row.try_get("registered_at").map_err(query_err)?;
    Ok(WaitingSignal {
        signal: row.try_get("signal").map_err(query_err)?,
        run_id: parse_uuid(&run_id)?,
        hashed_op_id: row.try_get("hashed_op_id").map_err(query_err)?,
        registered_at: parse_datetime(&registered_at)?,
    })
}

fn invoke_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WaitingInvoke, StoreError> {
    let child_run_id: String = row.try_get("child_run_id").map_err(query_err)?;
    let parent_run_id: String = row.try_get("parent_run_id").map_err(query_err)?;
    let registered_at: String = row.try_get("registered_at").map_err(query_err)?;
    Ok(WaitingInvoke {
        child_run_id: parse_uuid(&child_run_id)?,
        parent_run_id: parse_uuid(&parent_run_id)?,
        hashed_op_id: row.try_get("hashed_op_id").map_err(query_err)?,
        registered_at: parse_datetime(&registered_at)?,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn add_run(&self, run: &Run) -> Result<(), StoreError> {
        let ctx = serde_json::to_string(&run.ctx)?;
        let op_attempts = serde_json::to_string(&run.op_attempts)?;
        let result = run
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO runs
               (id, workflow_id, ctx, max_attempts, op_attempts, result, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(&ctx)
        .bind(run.max_attempts as i64)
        .bind(&op_attempts)
        .bind(&result)
        .bind(format_datetime(&run.started_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn finish_run(&self, run_id: Uuid, result: &RunResult) -> Result<(), StoreError> {
        let result_json = serde_json::to_string(result)?;
        let updated = sqlx::query("UPDATE runs SET result = ?, completed_at = ? WHERE id = ?")
            .bind(&result_json)
            .bind(format_datetime(&Utc::now()))
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn bump_op_attempt(&self, run_id: Uuid, hashed_op_id: &str) -> Result<u32, StoreError> {
        // Read-modify-write inside one transaction; the single writer
        // connection keeps concurrent bumps serialized.
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT op_attempts FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(StoreError::NotFound)?;
        let op_attempts: String = row.try_get("op_attempts").map_err(query_err)?;
        let mut attempts: HashMap<String, u32> = serde_json::from_str(&op_attempts)?;

        let count = attempts.entry(hashed_op_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        sqlx::query("UPDATE runs SET op_attempts = ? WHERE id = ?")
            .bind(serde_json::to_string(&attempts)?)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        Ok(count)
    }

    async fn reset_op_attempt(&self, run_id: Uuid, hashed_op_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT op_attempts FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(StoreError::NotFound)?;
        let op_attempts: String = row.try_get("op_attempts").map_err(query_err)?;
        let mut attempts: HashMap<String, u32> = serde_json::from_str(&op_attempts)?;
        attempts.insert(hashed_op_id.to_string(), 1);

        sqlx::query("UPDATE runs SET op_attempts = ? WHERE id = ?")
            .bind(serde_json::to_string(&attempts)?)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)
    }

    async fn get_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> Result<Option<OpResult>, StoreError> {
        let row = sqlx::query("SELECT op FROM ops WHERE run_id = ? AND hashed_op_id = ?")
            .bind(run_id.to_string())
            .bind(hashed_op_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let op: String = row.try_get("op").map_err(query_err)?;
                Ok(Some(serde_json::from_str(&op)?))
            }
            None => Ok(None),
        }
    }

    async fn set_op(&self, op: &OpResult, force: bool) -> Result<bool, StoreError> {
        let op_json = serde_json::to_string(op)?;
        let settled = op.outcome.is_settled() as i64;

        // The upsert only applies over an unsettled row unless forced; zero
        // affected rows means the settled guard blocked the write.
        let result = sqlx::query(
            r#"INSERT INTO ops (run_id, hashed_op_id, op, settled)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(run_id, hashed_op_id) DO UPDATE SET
                 op = excluded.op,
                 settled = excluded.settled
               WHERE ops.settled = 0 OR ? = 1"#,
        )
        .bind(op.run_id.to_string())
        .bind(&op.op_id.hashed)
        .bind(&op_json)
        .bind(settled)
        .bind(force as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        let written = result.rows_affected() > 0;
        if !written {
            warn!(
                run_id = %op.run_id,
                hashed_op_id = %op.op_id.hashed,
                "write to settled op blocked"
            );
        }
        Ok(written)
    }

    async fn list_ops(&self, run_id: Uuid) -> Result<Vec<OpResult>, StoreError> {
        let rows = sqlx::query("SELECT op FROM ops WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in &rows {
            let op: String = row.try_get("op").map_err(query_err)?;
            ops.push(serde_json::from_str(&op)?);
        }
        Ok(ops)
    }

    async fn push_waiting_signal(&self, waiting: &WaitingSignal) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO waiting_signals (signal, run_id, hashed_op_id, registered_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(&waiting.signal)
        .bind(waiting.run_id.to_string())
        .bind(&waiting.hashed_op_id)
        .bind(format_datetime(&waiting.registered_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn pop_waiting_signal(&self, signal: &str) -> Result<Option<WaitingSignal>, StoreError> {
        let row = sqlx::query(
            r#"DELETE FROM waiting_signals
               WHERE rowid = (
                 SELECT rowid FROM waiting_signals
                 WHERE signal = ?
                 ORDER BY registered_at ASC, rowid ASC
                 LIMIT 1
               )
               RETURNING signal, run_id, hashed_op_id, registered_at"#,
        )
        .bind(signal)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        row.as_ref().map(signal_from_row).transpose()
    }

    async fn pop_waiting_signal_for_op(
        &self,
        run_id: Uuid,
        hashed_op_id: &str,
    ) -> Result<Option<WaitingSignal>, StoreError> {
        let row = sqlx::query(
            r#"DELETE FROM waiting_signals
               WHERE rowid = (
                 SELECT rowid FROM waiting_signals
                 WHERE run_id = ? AND hashed_op_id = ?
                 LIMIT 1
               )
               RETURNING signal, run_id, hashed_op_id, registered_at"#,
        )
        .bind(run_id.to_string())
        .bind(hashed_op_id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        row.as_ref().map(signal_from_row).transpose()
    }

    async fn push_waiting_invoke(&self, waiting: &WaitingInvoke) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO waiting_invokes (child_run_id, parent_run_id, hashed_op_id, registered_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(child_run_id) DO UPDATE SET
                 parent_run_id = excluded.parent_run_id,
                 hashed_op_id = excluded.hashed_op_id,
                 registered_at = excluded.registered_at"#,
        )
        .bind(waiting.child_run_id.to_string())
        .bind(waiting.parent_run_id.to_string())
        .bind(&waiting.hashed_op_id)
        .bind(format_datetime(&waiting.registered_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn pop_waiting_invoke(
        &self,
        child_run_id: Uuid,
    ) -> Result<Option<WaitingInvoke>, StoreError> {
        let row = sqlx::query(
            r#"DELETE FROM waiting_invokes
               WHERE child_run_id = ?
               RETURNING child_run_id, parent_run_id, hashed_op_id, registered_at"#,
        )
        .bind(child_run_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        row.as_ref().map(invoke_from_row).transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
