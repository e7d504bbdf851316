//! SQLite storage backends for Quill.
//!
//! Three separate databases share one set of pool/migration helpers:
//!
//! - [`LedgerStore`] — the append-only signed audit ledger (`audit.db`).
//! - [`BehaviorStore`] — sliding-window risk behavior events (`behavior.db`).
//! - [`AuthStore`] — API keys and sessions (`auth.db`).
//!
//! All write paths are transactional; the ledger's append additionally runs
//! its read-then-insert pair under `BEGIN IMMEDIATE` so concurrent writers
//! serialize at the database.

use quill_core::{QuillError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

pub mod auth;
pub mod behavior;
pub mod ledger;
pub mod logger;
pub mod verify;

pub use auth::AuthStore;
pub use behavior::BehaviorStore;
pub use ledger::{LedgerQuery, LedgerStore};
pub use logger::{AuditLogger, RecordDraft};
pub use verify::{verify_chain, verify_record, ChainIssue, ChainReport};

/// Open (or create) a SQLite connection pool configured for Quill.
///
/// WAL journaling is enabled and a busy timeout covers the brief lock
/// contention between concurrent ledger writers.
pub(crate) async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| QuillError::Storage(format!("Invalid database URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // For in-memory databases every connection gets its own database, so
    // restrict the pool to a single connection to keep a consistent view.
    let max_conns: u32 = if database_url.contains(":memory:") { 1 } else { 10 };

    sqlx::pool::PoolOptions::<Sqlite>::new()
        .max_connections(max_conns)
        .connect_with(connect_opts)
        .await
        .map_err(|e| QuillError::Storage(format!("Failed to connect to SQLite: {e}")))
}

/// Run a list of migration statements against the given pool.
///
/// `ALTER TABLE … ADD COLUMN` statements are allowed to fail silently
/// (the column may already exist from a previous run).
pub(crate) async fn run_migrations(pool: &SqlitePool, statements: &[&str]) -> Result<()> {
    for statement in statements {
        let result = sqlx::query(statement).execute(pool).await;
        match result {
            Ok(_) => {}
            Err(e) => {
                let is_alter_add = statement.to_uppercase().contains("ALTER TABLE")
                    && statement.to_uppercase().contains("ADD COLUMN");
                let is_duplicate = e.to_string().contains("duplicate column");
                if is_alter_add && is_duplicate {
                    // Column already exists — safe to ignore
                    continue;
                }
                return Err(QuillError::Storage(format!("Migration failed: {e}")));
            }
        }
    }
    Ok(())
}
