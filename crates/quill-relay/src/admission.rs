//! Bearer-token admission.
//!
//! A presented token is tried as a session id first (fast indexed lookup),
//! then hashed and tried against the API-key table. Revoked or expired
//! credentials never authenticate.

use chrono::{DateTime, Utc};
use quill_core::Result;
use quill_storage::auth::{hash_token, AuthStore};

/// How the presented credential was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    Session,
    ApiKey,
}

/// The authenticated caller handed to the decision loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub kind: PrincipalKind,
    /// Subject id attributed to ledger records and the rate limiter.
    pub subject: String,
    pub scopes: Vec<String>,
    /// Per-subject requests-per-minute override, if the credential carries
    /// one.
    pub rate_limit_rpm: Option<u32>,
}

/// Resolve a bearer token to a principal, or `None` when it does not
/// authenticate.
pub async fn authenticate(store: &AuthStore, token: &str) -> Result<Option<Principal>> {
    // 1. Session id (fast path)
    if let Some(session) = store.get_session(token).await? {
        if !session.revoked && !is_expired(Some(&session.expires_at)) {
            // Sessions minted from an API key inherit that key's rpm
            // override.
            let rate_limit_rpm = if session.auth_method == "api_key" {
                store
                    .get_api_key(&session.subject)
                    .await?
                    .and_then(|key| key.rate_limit_rpm)
            } else {
                None
            };
            return Ok(Some(Principal {
                kind: PrincipalKind::Session,
                subject: session.subject,
                scopes: split_scopes(&session.scopes),
                rate_limit_rpm,
            }));
        }
        return Ok(None);
    }

    // 2. API key by secret hash
    if let Some(key) = store.get_api_key_by_hash(&hash_token(token)).await? {
        if !key.revoked && !is_expired(key.expires_at.as_deref()) {
            return Ok(Some(Principal {
                kind: PrincipalKind::ApiKey,
                subject: key.id,
                scopes: split_scopes(&key.scopes),
                rate_limit_rpm: key.rate_limit_rpm,
            }));
        }
    }

    Ok(None)
}

fn split_scopes(scopes: &str) -> Vec<String> {
    scopes
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// An unparseable expiry counts as expired.
fn is_expired(expires_at: Option<&str>) -> bool {
    match expires_at {
        None => false,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(expiry) => expiry.with_timezone(&Utc) <= Utc::now(),
            Err(_) => true,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
