//! The append-only audit ledger.
//!
//! Records are inserted through [`LedgerStore::insert_atomic`], which reads
//! the previous record's signature and inserts the new record inside a single
//! `BEGIN IMMEDIATE` transaction. Two concurrent writers therefore serialize
//! at the database and can never both chain onto the same predecessor.

use crate::{open_pool, run_migrations};
use quill_core::{AuditRecord, Direction, QuillError, Result, RiskLevel, Verdict};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const LEDGER_MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS audit_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        server_name TEXT NOT NULL,
        direction TEXT NOT NULL,
        method TEXT NOT NULL,
        message_id TEXT,
        tool_name TEXT,
        arguments TEXT,
        response TEXT,
        verdict TEXT NOT NULL,
        policy_hash TEXT NOT NULL,
        prev_hash TEXT NOT NULL,
        nonce TEXT NOT NULL UNIQUE,
        signature TEXT NOT NULL,
        public_key TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_records(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_audit_server ON audit_records(server_name)",
    "CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit_records(tool_name)",
    "CREATE INDEX IF NOT EXISTS idx_audit_verdict ON audit_records(verdict)",
    // Risk columns arrived after the initial schema; old rows read back NULL.
    "ALTER TABLE audit_records ADD COLUMN risk_score INTEGER",
    "ALTER TABLE audit_records ADD COLUMN risk_level TEXT",
];

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

/// Reconstruct an [`AuditRecord`] from a SQLite row.
fn record_from_row(row: &SqliteRow) -> Result<AuditRecord> {
    let direction = Direction::from_str(&row.get::<String, _>("direction"))
        .map_err(QuillError::Storage)?;
    let verdict =
        Verdict::from_str(&row.get::<String, _>("verdict")).map_err(QuillError::Storage)?;
    let risk_level = row
        .get::<Option<String>, _>("risk_level")
        .map(|s| RiskLevel::from_str(&s))
        .transpose()
        .map_err(QuillError::Storage)?;

    Ok(AuditRecord {
        id: row.get::<i64, _>("id"),
        timestamp: row.get("timestamp"),
        server_name: row.get("server_name"),
        direction,
        method: row.get("method"),
        message_id: row.get("message_id"),
        tool_name: row.get("tool_name"),
        arguments: row.get("arguments"),
        response: row.get("response"),
        verdict,
        risk_score: row.get::<Option<i64>, _>("risk_score").map(|v| v as u8),
        risk_level,
        policy_hash: row.get("policy_hash"),
        prev_hash: row.get("prev_hash"),
        nonce: row.get("nonce"),
        signature: row.get("signature"),
        public_key: row.get("public_key"),
    })
}

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

/// Filter parameters for [`LedgerStore::query`].
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    /// Exact server name.
    pub server: Option<String>,
    /// Exact tool name.
    pub tool: Option<String>,
    /// Verdict filter.
    pub verdict: Option<Verdict>,
    /// Only records at or after this RFC 3339 timestamp.
    pub since: Option<String>,
    /// Maximum number of records to return.
    pub limit: Option<u32>,
}

impl LedgerQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// SQLite-backed ledger store.
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    /// Open (or create) the ledger database and run schema migrations.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example() -> quill_core::Result<()> {
    /// let store = quill_storage::LedgerStore::new("sqlite::memory:").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        run_migrations(&pool, LEDGER_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    /// Append a record built by `build` under a serialized transaction.
    ///
    /// `build` receives the previous record's signature (or `None` for an
    /// empty ledger) and must return the fully signed record. The read and
    /// the insert commit as one atomic step; if `build` fails the
    /// transaction is rolled back. Returns the assigned record id.
    pub async fn insert_atomic<F>(&self, build: F) -> Result<i64>
    where
        F: FnOnce(Option<&str>) -> Result<AuditRecord>,
    {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to acquire connection: {e}")))?;

        // BEGIN IMMEDIATE takes the write lock up front, so the signature we
        // read below stays the chain tip until our insert commits.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to begin transaction: {e}")))?;

        match Self::append_in_tx(&mut conn, build).await {
            Ok(id) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| QuillError::Storage(format!("Failed to commit: {e}")))?;
                Ok(id)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn append_in_tx<F>(conn: &mut SqliteConnection, build: F) -> Result<i64>
    where
        F: FnOnce(Option<&str>) -> Result<AuditRecord>,
    {
        let prev_signature: Option<String> =
            sqlx::query("SELECT signature FROM audit_records ORDER BY id DESC LIMIT 1")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| QuillError::Storage(format!("Failed to read chain tip: {e}")))?
                .map(|row| row.get("signature"));

        let record = build(prev_signature.as_deref())?;

        let result = sqlx::query(
            "INSERT INTO audit_records (
                timestamp, server_name, direction, method, message_id,
                tool_name, arguments, response, verdict, risk_score,
                risk_level, policy_hash, prev_hash, nonce, signature,
                public_key
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15,
                ?16
            )",
        )
        .bind(&record.timestamp)
        .bind(&record.server_name)
        .bind(record.direction.to_string())
        .bind(&record.method)
        .bind(record.message_id.as_deref())
        .bind(record.tool_name.as_deref())
        .bind(record.arguments.as_deref())
        .bind(record.response.as_deref())
        .bind(record.verdict.to_string())
        .bind(record.risk_score.map(|v| v as i64))
        .bind(record.risk_level.map(|l| l.to_string()))
        .bind(&record.policy_hash)
        .bind(&record.prev_hash)
        .bind(&record.nonce)
        .bind(&record.signature)
        .bind(&record.public_key)
        .execute(&mut *conn)
        .await
        .map_err(|e| QuillError::Storage(format!("Failed to insert record: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    /// Fetch a single record by id.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<AuditRecord>> {
        let row = sqlx::query("SELECT * FROM audit_records WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to get record: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    /// All records in ascending id order (used by chain verification).
    pub async fn get_all(&self) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit_records ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to list records: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    /// The most recent `n` records, newest first.
    pub async fn get_last(&self, n: u32) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit_records ORDER BY id DESC LIMIT ?1")
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to list records: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    /// Records with id greater than `after`, ascending, at most `batch`.
    ///
    /// This is the cursor the external sync uploader walks.
    pub async fn get_after_id(&self, after: i64, batch: u32) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit_records WHERE id > ?1 ORDER BY id ASC LIMIT ?2")
            .bind(after)
            .bind(batch as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to page records: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    /// Filtered query, newest first.
    pub async fn query(&self, query: &LedgerQuery) -> Result<Vec<AuditRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_records WHERE 1 = 1");

        if let Some(ref server) = query.server {
            qb.push(" AND server_name = ");
            qb.push_bind(server.clone());
        }
        if let Some(ref tool) = query.tool {
            qb.push(" AND tool_name = ");
            qb.push_bind(tool.clone());
        }
        if let Some(verdict) = query.verdict {
            qb.push(" AND verdict = ");
            qb.push_bind(verdict.to_string());
        }
        if let Some(ref since) = query.since {
            qb.push(" AND timestamp >= ");
            qb.push_bind(since.clone());
        }

        qb.push(" ORDER BY id DESC");

        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to query records: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    /// Total number of records.
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) as cnt FROM audit_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to count records: {e}")))?
            .get("cnt");
        Ok(count as u64)
    }

    /// Health check for the ledger database.
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

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::sha256_hex;

    async fn test_store() -> LedgerStore {
        LedgerStore::new("sqlite::memory:").await.unwrap()
    }

    /// Build an unsigned-but-plausible record for store-level tests.
    /// Signing-path tests live alongside [`crate::logger`].
    fn make_record(prev_signature: Option<&str>, tool: &str, verdict: Verdict) -> AuditRecord {
        AuditRecord {
            id: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            server_name: "builder-mcp".to_string(),
            direction: Direction::Request,
            method: "tools/call".to_string(),
            message_id: Some("1".to_string()),
            tool_name: Some(tool.to_string()),
            arguments: None,
            response: None,
            verdict,
            risk_score: None,
            risk_level: None,
            policy_hash: "aa".repeat(32),
            prev_hash: prev_signature
                .map(|sig| sha256_hex(sig.as_bytes()))
                .unwrap_or_default(),
            nonce: uuid::Uuid::new_v4().to_string(),
            signature: hex::encode(uuid::Uuid::new_v4().as_bytes()),
            public_key: "test-key".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = test_store().await;
        let id = store
            .insert_atomic(|prev| {
                assert!(prev.is_none());
                Ok(make_record(prev, "ReadFile", Verdict::Allow))
            })
            .await
            .unwrap();
        assert_eq!(id, 1);

        let record = store.get_by_id(1).await.unwrap().expect("record exists");
        assert_eq!(record.tool_name.as_deref(), Some("ReadFile"));
        assert_eq!(record.prev_hash, "");
        assert!(store.get_by_id(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_chained() {
        let store = test_store().await;
        for i in 0..5 {
            let tool = format!("Tool{i}");
            store
                .insert_atomic(|prev| Ok(make_record(prev, &tool, Verdict::Allow)))
                .await
                .unwrap();
        }

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 5);
        for (i, record) in all.iter().enumerate() {
            assert_eq!(record.id, i as i64 + 1);
        }
        for pair in all.windows(2) {
            assert_eq!(pair[1].prev_hash, sha256_hex(pair[0].signature.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_builder_failure_rolls_back() {
        let store = test_store().await;
        store
            .insert_atomic(|prev| Ok(make_record(prev, "A", Verdict::Allow)))
            .await
            .unwrap();

        let err = store
            .insert_atomic(|_| Err(QuillError::Crypto("signing failed".to_string())))
            .await;
        assert!(err.is_err());
        assert_eq!(store.count().await.unwrap(), 1);

        // The store still accepts writes after a rollback
        store
            .insert_atomic(|prev| Ok(make_record(prev, "B", Verdict::Allow)))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_nonce_rejected() {
        let store = test_store().await;
        let mut fixed = make_record(None, "A", Verdict::Allow);
        fixed.nonce = "fixed-nonce".to_string();
        let clone = fixed.clone();

        store.insert_atomic(move |_| Ok(fixed)).await.unwrap();
        let dup = store.insert_atomic(move |_| Ok(clone)).await;
        assert!(dup.is_err());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_last_descending() {
        let store = test_store().await;
        for i in 0..4 {
            let tool = format!("Tool{i}");
            store
                .insert_atomic(|prev| Ok(make_record(prev, &tool, Verdict::Allow)))
                .await
                .unwrap();
        }
        let last = store.get_last(2).await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].id, 4);
        assert_eq!(last[1].id, 3);
    }

    #[tokio::test]
    async fn test_get_after_id_pages_ascending() {
        let store = test_store().await;
        for i in 0..6 {
            let tool = format!("Tool{i}");
            store
                .insert_atomic(|prev| Ok(make_record(prev, &tool, Verdict::Allow)))
                .await
                .unwrap();
        }
        let page = store.get_after_id(2, 3).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        let tail = store.get_after_id(5, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, 6);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = test_store().await;
        store
            .insert_atomic(|prev| Ok(make_record(prev, "ReadFile", Verdict::Allow)))
            .await
            .unwrap();
        store
            .insert_atomic(|prev| Ok(make_record(prev, "DeleteFile", Verdict::Deny)))
            .await
            .unwrap();
        store
            .insert_atomic(|prev| {
                let mut r = make_record(prev, "DeleteFile", Verdict::Deny);
                r.server_name = "other-mcp".to_string();
                Ok(r)
            })
            .await
            .unwrap();

        let denies = store
            .query(&LedgerQuery::new().with_verdict(Verdict::Deny))
            .await
            .unwrap();
        assert_eq!(denies.len(), 2);

        let scoped = store
            .query(
                &LedgerQuery::new()
                    .with_verdict(Verdict::Deny)
                    .with_server("builder-mcp"),
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);

        let by_tool = store
            .query(&LedgerQuery::new().with_tool("ReadFile"))
            .await
            .unwrap();
        assert_eq!(by_tool.len(), 1);

        let limited = store
            .query(&LedgerQuery::new().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, 3); // newest first
    }

    #[tokio::test]
    async fn test_query_since() {
        let store = test_store().await;
        store
            .insert_atomic(|prev| {
                let mut r = make_record(prev, "Old", Verdict::Allow);
                r.timestamp = "2020-01-01T00:00:00+00:00".to_string();
                Ok(r)
            })
            .await
            .unwrap();
        store
            .insert_atomic(|prev| Ok(make_record(prev, "New", Verdict::Allow)))
            .await
            .unwrap();

        let recent = store
            .query(&LedgerQuery::new().with_since("2025-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tool_name.as_deref(), Some("New"));
    }

    #[tokio::test]
    async fn test_risk_columns_roundtrip() {
        let store = test_store().await;
        store
            .insert_atomic(|prev| {
                let mut r = make_record(prev, "DeleteFile", Verdict::Deny);
                r.risk_score = Some(92);
                r.risk_level = Some(RiskLevel::Critical);
                Ok(r)
            })
            .await
            .unwrap();

        let record = store.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(record.risk_score, Some(92));
        assert_eq!(record.risk_level, Some(RiskLevel::Critical));
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("audit.db").display());
        let first = LedgerStore::new(&url).await.unwrap();
        first
            .insert_atomic(|prev| Ok(make_record(prev, "A", Verdict::Allow)))
            .await
            .unwrap();
        first.close().await;

        // Reopening re-runs migrations, including the ALTER statements.
        let second = LedgerStore::new(&url).await.unwrap();
        assert_eq!(second.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = test_store().await;
        assert!(store.health_check().await.is_ok());
    }
}
