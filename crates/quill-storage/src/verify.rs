//! Ledger chain verification.
//!
//! Third parties holding the operator's public key can re-check every
//! record's signature and the hash links between adjacent records. A break
//! anywhere downstream of a tampered record shows up as both an invalid
//! signature on the tampered record and a prev-hash mismatch on its
//! successor.

use crate::ledger::LedgerStore;
use quill_core::keystore::verify_hex;
use quill_core::{canonical_json, sha256_hex, AuditRecord, Result};

/// One problem found during a chain walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIssue {
    /// Id of the offending record.
    pub id: i64,
    pub reason: String,
}

/// Outcome of a full-chain verification walk.
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    /// Number of records examined.
    pub checked: usize,
    /// Every signature or linkage failure, in id order.
    pub issues: Vec<ChainIssue>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verify a single record's signature against its embedded public key.
pub fn verify_record(record: &AuditRecord) -> Result<bool> {
    let canonical = canonical_json(&record.signable_view())?;
    verify_hex(&record.public_key, &canonical, &record.signature)
}

/// Walk records (which must be in ascending id order) and report every
/// signature failure and prev-hash mismatch.
pub fn verify_chain(records: &[AuditRecord]) -> ChainReport {
    let mut report = ChainReport {
        checked: records.len(),
        issues: Vec::new(),
    };

    let mut prev: Option<&AuditRecord> = None;
    for record in records {
        match verify_record(record) {
            Ok(true) => {}
            Ok(false) => report.issues.push(ChainIssue {
                id: record.id,
                reason: "signature does not verify against signable view".to_string(),
            }),
            Err(e) => report.issues.push(ChainIssue {
                id: record.id,
                reason: format!("signature check failed: {e}"),
            }),
        }

        let expected_prev = match prev {
            Some(p) => sha256_hex(p.signature.as_bytes()),
            None => String::new(),
        };
        if record.prev_hash != expected_prev {
            report.issues.push(ChainIssue {
                id: record.id,
                reason: format!(
                    "prev_hash mismatch: expected '{expected_prev}', found '{}'",
                    record.prev_hash
                ),
            });
        }
        prev = Some(record);
    }

    report
}

/// Load the entire ledger and verify it end to end.
pub async fn verify_ledger(store: &LedgerStore) -> Result<ChainReport> {
    let records = store.get_all().await?;
    Ok(verify_chain(&records))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
