//! Persistent sliding-window behavior events for the risk engine.
//!
//! Each high-risk decision records a `(subject_id, timestamp_ms)` row.
//! Counting is what prunes: rows at or before the cutoff are deleted for the
//! subject, then the survivors are counted.

use crate::{open_pool, run_migrations};
use quill_core::{QuillError, Result};
use sqlx::{Row, SqlitePool};

const BEHAVIOR_MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS behavior_events (
        subject_id TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_behavior_subject ON behavior_events(subject_id)",
    "CREATE INDEX IF NOT EXISTS idx_behavior_time ON behavior_events(timestamp_ms)",
];

/// SQLite-backed behavior event store.
pub struct BehaviorStore {
    pool: SqlitePool,
}

impl BehaviorStore {
    /// Open (or create) the behavior database and run schema migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        run_migrations(&pool, BEHAVIOR_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    /// Record one behavior event for a subject.
    pub async fn record(&self, subject_id: &str, timestamp_ms: i64) -> Result<()> {
        sqlx::query("INSERT INTO behavior_events (subject_id, timestamp_ms) VALUES (?1, ?2)")
            .bind(subject_id)
            .bind(timestamp_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to record behavior event: {e}")))?;
        Ok(())
    }

    /// Count events for a subject newer than `cutoff_ms`, pruning everything
    /// at or before the cutoff first.
    pub async fn count(&self, subject_id: &str, cutoff_ms: i64) -> Result<u32> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to begin transaction: {e}")))?;

        sqlx::query("DELETE FROM behavior_events WHERE subject_id = ?1 AND timestamp_ms <= ?2")
            .bind(subject_id)
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to prune behavior events: {e}")))?;

        let count: i64 = sqlx::query(
            "SELECT COUNT(*) as cnt FROM behavior_events WHERE subject_id = ?1",
        )
        .bind(subject_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| QuillError::Storage(format!("Failed to count behavior events: {e}")))?
        .get("cnt");

        tx.commit()
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to commit: {e}")))?;

        Ok(count as u32)
    }

    /// Health check for the behavior database.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Health check failed: {e}")))?;
        Ok(())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
