//! Split reader/writer SQLite pool.
//!
//! Every mutation in this crate funnels through a writer pool capped at one
//! connection. The registry pops and queue dequeues are single
//! `DELETE .. RETURNING` statements, and the lone writer connection is what
//! makes them atomic claims: two pollers cannot interleave on it. Reads fan
//! out over a separate read-only pool so replay ticks scanning the op
//! ledger never queue behind writes. Both sides run in WAL mode.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

const READER_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Paired pools over one database file.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only pool for SELECTs.
    pub reader: SqlitePool,
    /// Single-connection pool; all mutations and atomic claims go here.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and bring the schema up to date.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;

        // The schema must exist before the read-only side connects.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(opts.read_only(true))
            .await?;

        info!(readers = READER_CONNECTIONS, "sqlite pool ready");
        Ok(Self { reader, writer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(table_names.contains(&"runs"), "runs table missing");
        assert!(table_names.contains(&"ops"), "ops table missing");
        assert!(
            table_names.contains(&"waiting_signals"),
            "waiting_signals table missing"
        );
        assert!(
            table_names.contains(&"waiting_invokes"),
            "waiting_invokes table missing"
        );
        assert!(table_names.contains(&"event_queue"), "event_queue table missing");
        assert!(table_names.contains(&"exec_queue"), "exec_queue table missing");
    }

    #[tokio::test]
    async fn pool_uses_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test_wal.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn reader_pool_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test_ro.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let result = sqlx::query("INSERT INTO exec_queue (id, run_at, payload) VALUES ('x', 0, '{}')")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
    }
}
