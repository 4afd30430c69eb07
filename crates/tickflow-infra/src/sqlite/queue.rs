//! SQLite [`WorkQueue`] implementation.
//!
//! Items are JSON payloads keyed by a UUIDv7 id with a millisecond `run_at`
//! column. Dequeue is a single DELETE..RETURNING on the writer connection,
//! so concurrent pollers can never double-claim an item.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use tickflow_core::queue::WorkQueue;
use tickflow_types::error::QueueError;
use tracing::debug;
use uuid::Uuid;

use super::pool::DatabasePool;

/// Names of the two queue tables created by the migrations.
const EVENT_QUEUE_TABLE: &str = "event_queue";
const EXEC_QUEUE_TABLE: &str = "exec_queue";

/// SQLite-backed [`WorkQueue`] over one of the queue tables.
pub struct SqliteWorkQueue<T> {
    pool: DatabasePool,
    table: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SqliteWorkQueue<T> {
    /// Queue over the `event_queue` table (trigger events).
    pub fn events(pool: DatabasePool) -> Self {
        Self::over(pool, EVENT_QUEUE_TABLE)
    }

    /// Queue over the `exec_queue` table (execution items).
    pub fn execs(pool: DatabasePool) -> Self {
        Self::over(pool, EXEC_QUEUE_TABLE)
    }

    fn over(pool: DatabasePool, table: &'static str) -> Self {
        Self {
            pool,
            table,
            _marker: PhantomData,
        }
    }
}

impl<T> WorkQueue<T> for SqliteWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn add(&self, item: &T, run_at: DateTime<Utc>) -> Result<(), QueueError> {
        let payload = serde_json::to_string(item)?;
        let sql = format!(
            "INSERT INTO {} (id, run_at, payload) VALUES (?, ?, ?)",
            self.table
        );
        sqlx::query(&sql)
            .bind(Uuid::now_v7().to_string())
            .bind(run_at.timestamp_millis())
            .bind(&payload)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        Ok(())
    }

    async fn get_next(&self) -> Result<Option<T>, QueueError> {
        // UUIDv7 ids are time-sortable, which breaks run_at ties in
        // insertion order.
        let sql = format!(
            r#"DELETE FROM {table}
               WHERE id = (
                 SELECT id FROM {table}
                 WHERE run_at <= ?
                 ORDER BY run_at ASC, id ASC
                 LIMIT 1
               )
               RETURNING payload"#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;

        match row {
            Some(row) => {
                let payload: String = row
                    .try_get("payload")
                    .map_err(|e| QueueError::Io(e.to_string()))?;
                debug!(table = self.table, "queue item claimed");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}
