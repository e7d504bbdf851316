//! API keys and sessions.
//!
//! The raw API-key secret (`qk_` + 64 hex chars) is shown to the operator
//! exactly once at creation; only its SHA-256 hex digest is stored. Sessions
//! are opaque bearer tokens minted by an external flow and checked here for
//! revocation and expiry.

use crate::{open_pool, run_migrations};
use chrono::Utc;
use quill_core::{ApiKey, QuillError, Result, Session};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Prefix for generated API keys (and their public handles).
const KEY_PREFIX: &str = "qk_";

/// Number of random bytes in a generated API key (256 bits).
const KEY_RANDOM_BYTES: usize = 32;

/// Number of random bytes in the short public handle.
const KEY_ID_BYTES: usize = 6;

const AUTH_MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT NOT NULL PRIMARY KEY,
        key_hash TEXT NOT NULL UNIQUE,
        owner TEXT NOT NULL,
        label TEXT NOT NULL,
        scopes TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        expires_at TEXT,
        revoked INTEGER NOT NULL DEFAULT 0,
        rate_limit_rpm INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys(key_hash)",
    "CREATE TABLE IF NOT EXISTS sessions (
        token TEXT NOT NULL PRIMARY KEY,
        subject TEXT NOT NULL,
        auth_method TEXT NOT NULL,
        scopes TEXT NOT NULL DEFAULT '',
        issued_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        revoked INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject)",
];

// ---------------------------------------------------------------------------
// Key generation & hashing
// ---------------------------------------------------------------------------

/// Generate a new random API key, returning `(id, plaintext, sha256_hex)`.
#[must_use]
pub fn generate_api_key() -> (String, String, String) {
    let mut random_bytes = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    let plaintext = format!("{KEY_PREFIX}{}", hex::encode(random_bytes));

    let mut id_bytes = [0u8; KEY_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut id_bytes);
    let id = format!("{KEY_PREFIX}{}", hex::encode(id_bytes));

    let hash = hash_token(&plaintext);
    (id, plaintext, hash)
}

/// SHA-256 hex digest of a bearer token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn api_key_from_row(row: &SqliteRow) -> ApiKey {
    ApiKey {
        id: row.get("id"),
        key_hash: row.get("key_hash"),
        owner: row.get("owner"),
        label: row.get("label"),
        scopes: row.get("scopes"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        revoked: row.get::<i64, _>("revoked") != 0,
        rate_limit_rpm: row.get::<Option<i64>, _>("rate_limit_rpm").map(|v| v as u32),
    }
}

fn session_from_row(row: &SqliteRow) -> Session {
    Session {
        token: row.get("token"),
        subject: row.get("subject"),
        auth_method: row.get("auth_method"),
        scopes: row.get("scopes"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        revoked: row.get::<i64, _>("revoked") != 0,
    }
}

// ---------------------------------------------------------------------------
// AuthStore
// ---------------------------------------------------------------------------

/// SQLite-backed store for API keys and sessions.
pub struct AuthStore {
    pool: SqlitePool,
}

impl AuthStore {
    /// Open (or create) the auth database and run schema migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        run_migrations(&pool, AUTH_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    /// Create a new API key. Returns the stored record and the plaintext
    /// secret, which is never persisted and never shown again.
    pub async fn create_api_key(
        &self,
        owner: &str,
        label: &str,
        scopes: &str,
        expires_at: Option<String>,
        rate_limit_rpm: Option<u32>,
    ) -> Result<(ApiKey, String)> {
        let (id, plaintext, key_hash) = generate_api_key();
        let record = ApiKey {
            id,
            key_hash,
            owner: owner.to_string(),
            label: label.to_string(),
            scopes: scopes.to_string(),
            created_at: Utc::now().to_rfc3339(),
            expires_at,
            revoked: false,
            rate_limit_rpm,
        };

        sqlx::query(
            "INSERT INTO api_keys (
                id, key_hash, owner, label, scopes, created_at, expires_at,
                revoked, rate_limit_rpm
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.id)
        .bind(&record.key_hash)
        .bind(&record.owner)
        .bind(&record.label)
        .bind(&record.scopes)
        .bind(&record.created_at)
        .bind(record.expires_at.as_deref())
        .bind(record.revoked as i64)
        .bind(record.rate_limit_rpm.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| QuillError::Storage(format!("Failed to create API key: {e}")))?;

        Ok((record, plaintext))
    }

    /// Look up an API key by the SHA-256 hex of its raw secret.
    pub async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ?1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to look up API key: {e}")))?;
        Ok(row.as_ref().map(api_key_from_row))
    }

    /// Look up an API key by its public handle.
    pub async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to look up API key: {e}")))?;
        Ok(row.as_ref().map(api_key_from_row))
    }

    /// List all API keys, newest first.
    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to list API keys: {e}")))?;
        Ok(rows.iter().map(api_key_from_row).collect())
    }

    /// Revoke an API key. Returns `false` if no such key exists.
    pub async fn revoke_api_key(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET revoked = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to revoke API key: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// Set or clear the per-key requests-per-minute override.
    pub async fn set_rate_limit_rpm(&self, id: &str, rpm: Option<u32>) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET rate_limit_rpm = ?1 WHERE id = ?2")
            .bind(rpm.map(|v| v as i64))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to update rate limit: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a session.
    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (
                token, subject, auth_method, scopes, issued_at, expires_at, revoked
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&session.token)
        .bind(&session.subject)
        .bind(&session.auth_method)
        .bind(&session.scopes)
        .bind(&session.issued_at)
        .bind(&session.expires_at)
        .bind(session.revoked as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QuillError::Storage(format!("Failed to create session: {e}")))?;
        Ok(())
    }

    /// Look up a session by its token (fast indexed path).
    pub async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to look up session: {e}")))?;
        Ok(row.as_ref().map(session_from_row))
    }

    /// Revoke a session. Returns `false` if no such session exists.
    pub async fn revoke_session(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET revoked = 1 WHERE token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| QuillError::Storage(format!("Failed to revoke session: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// Health check for the auth database.
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

    async fn test_store() -> AuthStore {
        AuthStore::new("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn test_generate_api_key_format() {
        let (id, plaintext, hash) = generate_api_key();
        assert!(id.starts_with("qk_"));
        assert!(plaintext.starts_with("qk_"));
        // 3-char prefix + 64 hex chars
        assert_eq!(plaintext.len(), 3 + KEY_RANDOM_BYTES * 2);
        // SHA-256 hex = 64 chars
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token(&plaintext));
    }

    #[test]
    fn test_hash_token_deterministic() {
        assert_eq!(hash_token("qk_abc"), hash_token("qk_abc"));
        assert_ne!(hash_token("qk_abc"), hash_token("qk_abd"));
    }

    #[tokio::test]
    async fn test_create_and_look_up_key() {
        let store = test_store().await;
        let (record, plaintext) = store
            .create_api_key("ops", "ci runner", "relay", None, Some(30))
            .await
            .unwrap();

        let found = store
            .get_api_key_by_hash(&hash_token(&plaintext))
            .await
            .unwrap()
            .expect("key should exist");
        assert_eq!(found.id, record.id);
        assert_eq!(found.owner, "ops");
        assert_eq!(found.rate_limit_rpm, Some(30));
        assert!(!found.revoked);

        // The plaintext itself is never stored
        assert_ne!(found.key_hash, plaintext);
    }

    #[tokio::test]
    async fn test_revoke_api_key() {
        let store = test_store().await;
        let (record, _) = store
            .create_api_key("ops", "key", "", None, None)
            .await
            .unwrap();

        assert!(store.revoke_api_key(&record.id).await.unwrap());
        let found = store.get_api_key(&record.id).await.unwrap().unwrap();
        assert!(found.revoked);

        assert!(!store.revoke_api_key("qk_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_rate_limit_rpm() {
        let store = test_store().await;
        let (record, _) = store
            .create_api_key("ops", "key", "", None, None)
            .await
            .unwrap();
        assert!(store
            .set_rate_limit_rpm(&record.id, Some(120))
            .await
            .unwrap());
        let found = store.get_api_key(&record.id).await.unwrap().unwrap();
        assert_eq!(found.rate_limit_rpm, Some(120));

        assert!(store.set_rate_limit_rpm(&record.id, None).await.unwrap());
        let found = store.get_api_key(&record.id).await.unwrap().unwrap();
        assert_eq!(found.rate_limit_rpm, None);
    }

    #[tokio::test]
    async fn test_list_api_keys() {
        let store = test_store().await;
        store
            .create_api_key("ops", "one", "", None, None)
            .await
            .unwrap();
        store
            .create_api_key("ops", "two", "", None, None)
            .await
            .unwrap();
        assert_eq!(store.list_api_keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = test_store().await;
        let session = Session {
            token: "sess-token-1".to_string(),
            subject: "qk_abc123".to_string(),
            auth_method: "api_key".to_string(),
            scopes: "relay".to_string(),
            issued_at: Utc::now().to_rfc3339(),
            expires_at: (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            revoked: false,
        };
        store.create_session(&session).await.unwrap();

        let found = store
            .get_session("sess-token-1")
            .await
            .unwrap()
            .expect("session exists");
        assert_eq!(found.subject, "qk_abc123");

        assert!(store.revoke_session("sess-token-1").await.unwrap());
        let found = store.get_session("sess-token-1").await.unwrap().unwrap();
        assert!(found.revoked);

        assert!(store.get_session("missing").await.unwrap().is_none());
    }
}
