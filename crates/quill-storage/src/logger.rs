//! The signing audit logger.
//!
//! [`AuditLogger`] turns per-message [`RecordDraft`]s into fully signed,
//! hash-chained [`AuditRecord`]s and appends them through
//! [`LedgerStore::insert_atomic`]. The chain fields (timestamp, nonce,
//! prev-hash, signature) are stamped inside the atomic builder so the record
//! is signed against the true chain tip.

use crate::ledger::LedgerStore;
use chrono::Utc;
use quill_core::keystore::OperatorKeys;
use quill_core::{canonical_json, sha256_hex, AuditRecord, Direction, Result, RiskLevel, Verdict};
use std::sync::Arc;
use uuid::Uuid;

/// The caller-supplied fields of one audit record.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub server_name: String,
    pub direction: Direction,
    pub method: String,
    pub message_id: Option<String>,
    pub tool_name: Option<String>,
    pub arguments: Option<String>,
    pub response: Option<String>,
    pub verdict: Verdict,
    pub risk_score: Option<u8>,
    pub risk_level: Option<RiskLevel>,
}

impl RecordDraft {
    /// A request-direction draft with the common fields set.
    pub fn request(server_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            direction: Direction::Request,
            method: method.into(),
            message_id: None,
            tool_name: None,
            arguments: None,
            response: None,
            verdict: Verdict::Passthrough,
            risk_score: None,
            risk_level: None,
        }
    }

    /// A response-direction draft with the common fields set.
    pub fn response(server_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            direction: Direction::Response,
            ..Self::request(server_name, method)
        }
    }

    pub fn with_message_id(mut self, id: Option<String>) -> Self {
        self.message_id = id;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, arguments: Option<String>) -> Self {
        self.tool_name = Some(tool.into());
        self.arguments = arguments;
        self
    }

    pub fn with_response_body(mut self, body: impl Into<String>) -> Self {
        self.response = Some(body.into());
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn with_risk(mut self, score: u8, level: RiskLevel) -> Self {
        self.risk_score = Some(score);
        self.risk_level = Some(level);
        self
    }
}

/// Signs record drafts and appends them to the ledger.
pub struct AuditLogger {
    store: Arc<LedgerStore>,
    keys: Arc<OperatorKeys>,
    policy_hash: String,
}

impl AuditLogger {
    pub fn new(store: Arc<LedgerStore>, keys: Arc<OperatorKeys>, policy_hash: String) -> Self {
        Self {
            store,
            keys,
            policy_hash,
        }
    }

    /// The ledger store backing this logger.
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// The policy hash pinned into every record this logger signs.
    pub fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    /// Sign and append one record; returns its assigned id.
    pub async fn append(&self, draft: RecordDraft) -> Result<i64> {
        let keys = Arc::clone(&self.keys);
        let policy_hash = self.policy_hash.clone();

        self.store
            .insert_atomic(move |prev_signature| {
                let prev_hash = prev_signature
                    .map(|sig| sha256_hex(sig.as_bytes()))
                    .unwrap_or_default();

                let mut record = AuditRecord {
                    id: 0,
                    timestamp: Utc::now().to_rfc3339(),
                    server_name: draft.server_name,
                    direction: draft.direction,
                    method: draft.method,
                    message_id: draft.message_id,
                    tool_name: draft.tool_name,
                    arguments: draft.arguments,
                    response: draft.response,
                    verdict: draft.verdict,
                    risk_score: draft.risk_score,
                    risk_level: draft.risk_level,
                    policy_hash,
                    prev_hash,
                    nonce: Uuid::new_v4().to_string(),
                    signature: String::new(),
                    public_key: keys.public_key_pem.clone(),
                };

                let canonical = canonical_json(&record.signable_view())?;
                record.signature = keys.sign_hex(&canonical);
                Ok(record)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::keystore::verify_hex;

    async fn test_logger() -> AuditLogger {
        let store = Arc::new(LedgerStore::new("sqlite::memory:").await.unwrap());
        let keys = Arc::new(OperatorKeys::generate().unwrap());
        AuditLogger::new(store, keys, "ab".repeat(32))
    }

    fn tool_call_draft(tool: &str) -> RecordDraft {
        RecordDraft::request("builder-mcp", "tools/call")
            .with_message_id(Some("7".to_string()))
            .with_tool(tool, Some(r#"{"path":"/tmp/a"}"#.to_string()))
            .with_verdict(Verdict::Allow)
    }

    #[tokio::test]
    async fn test_append_signs_record() {
        let logger = test_logger().await;
        let id = logger.append(tool_call_draft("ReadFile")).await.unwrap();

        let record = logger.store().get_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.prev_hash, "");
        assert!(!record.nonce.is_empty());
        assert_eq!(record.policy_hash, "ab".repeat(32));

        let canonical = canonical_json(&record.signable_view()).unwrap();
        assert!(verify_hex(&record.public_key, &canonical, &record.signature).unwrap());
    }

    #[tokio::test]
    async fn test_chain_links_by_signature_hash() {
        let logger = test_logger().await;
        logger.append(tool_call_draft("A")).await.unwrap();
        logger.append(tool_call_draft("B")).await.unwrap();
        logger.append(tool_call_draft("C")).await.unwrap();

        let all = logger.store().get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].prev_hash, sha256_hex(all[0].signature.as_bytes()));
        assert_eq!(all[2].prev_hash, sha256_hex(all[1].signature.as_bytes()));
    }

    #[tokio::test]
    async fn test_nonces_unique_across_records() {
        let logger = test_logger().await;
        for _ in 0..10 {
            logger.append(tool_call_draft("ReadFile")).await.unwrap();
        }
        let all = logger.store().get_all().await.unwrap();
        let mut nonces: Vec<&str> = all.iter().map(|r| r.nonce.as_str()).collect();
        nonces.sort();
        nonces.dedup();
        assert_eq!(nonces.len(), 10);
    }

    #[tokio::test]
    async fn test_tampered_risk_score_invalidates_signature() {
        let logger = test_logger().await;
        let id = logger
            .append(tool_call_draft("DeleteFile").with_risk(80, RiskLevel::High))
            .await
            .unwrap();

        let mut record = logger.store().get_by_id(id).await.unwrap().unwrap();
        let canonical = canonical_json(&record.signable_view()).unwrap();
        assert!(verify_hex(&record.public_key, &canonical, &record.signature).unwrap());

        record.risk_score = Some(5);
        let tampered = canonical_json(&record.signable_view()).unwrap();
        assert!(!verify_hex(&record.public_key, &tampered, &record.signature).unwrap());

        record.risk_score = Some(80);
        record.risk_level = Some(RiskLevel::Low);
        let tampered = canonical_json(&record.signable_view()).unwrap();
        assert!(!verify_hex(&record.public_key, &tampered, &record.signature).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_appends_share_one_store() {
        let store = Arc::new(LedgerStore::new("sqlite::memory:").await.unwrap());
        let keys = Arc::new(OperatorKeys::generate().unwrap());
        let logger_a = Arc::new(AuditLogger::new(
            Arc::clone(&store),
            Arc::clone(&keys),
            "cd".repeat(32),
        ));
        let logger_b = Arc::new(AuditLogger::new(
            Arc::clone(&store),
            keys,
            "cd".repeat(32),
        ));

        let task = |logger: Arc<AuditLogger>, tool: &'static str| {
            tokio::spawn(async move {
                for _ in 0..10 {
                    logger.append(tool_call_draft(tool)).await.unwrap();
                }
            })
        };
        let (a, b) = tokio::join!(task(logger_a, "A"), task(logger_b, "B"));
        a.unwrap();
        b.unwrap();

        // Twenty records with contiguous ids and an intact chain.
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 20);
        for (i, record) in all.iter().enumerate() {
            assert_eq!(record.id, i as i64 + 1);
        }
        assert_eq!(all[0].prev_hash, "");
        for pair in all.windows(2) {
            assert_eq!(pair[1].prev_hash, sha256_hex(pair[0].signature.as_bytes()));
        }
    }
}
