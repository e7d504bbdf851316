//! Core types, traits, and errors for Quill
//!
//! This crate contains the foundational types shared across all Quill
//! components: the declarative policy model, the signed audit-record entity,
//! verdicts and risk levels, plus the canonical-JSON and keystore primitives
//! that the ledger builds on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod canonical;
pub mod keystore;

pub use canonical::{canonical_json, hash_canonical, policy_hash, sha256_hex};
pub use keystore::{KeyLoad, Keystore, OperatorKeys};

// ---------------------------------------------------------------------------
// Verdicts & risk levels
// ---------------------------------------------------------------------------

/// Outcome of the decision pipeline for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Tool call evaluated and permitted.
    Allow,
    /// Tool call blocked by policy or risk.
    Deny,
    /// Message was not subject to evaluation (non-tool-call or parse failure).
    Passthrough,
    /// Request rejected by the rate limiter before evaluation.
    RateLimited,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Passthrough => "passthrough",
            Verdict::RateLimited => "rate_limited",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Verdict::Allow),
            "deny" => Ok(Verdict::Deny),
            "passthrough" => Ok(Verdict::Passthrough),
            "rate_limited" => Ok(Verdict::RateLimited),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

/// Risk level derived from the numeric risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

/// Direction of an audited message relative to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "request" => Ok(Direction::Request),
            "response" => Ok(Direction::Response),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy model
// ---------------------------------------------------------------------------

/// Action taken by a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

/// A glob rule for one tool within a server policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRule {
    /// Glob pattern matched against the tool name (`*` and `?` wildcards).
    pub tool: String,
    /// Action when the pattern matches.
    pub action: Action,
}

/// Policy entry for one tool server (or a glob of servers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPolicy {
    /// Server-name pattern; `*` matches any server.
    pub server: String,
    /// Action when no tool rule matches.
    pub default_action: Action,
    /// Ordered tool rules; first match wins.
    #[serde(default)]
    pub tools: Vec<ToolRule>,
}

/// Global rate-limit settings carried by the policy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests per minute allowed per subject.
    pub requests_per_minute: u32,
    /// Extra requests tolerated above the per-minute cap.
    #[serde(default)]
    pub burst: u32,
}

/// The declarative mediation policy, loaded from `policy.json`.
///
/// Server entries are evaluated in declared order; the first entry whose
/// `server` pattern matches wins. A request whose server matches no entry is
/// denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Schema version; must be `1`.
    pub version: u32,
    /// Data directory for the ledger, keys, and behavior store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Log level for the relay (`trace` … `error`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional global rate limit applied to every subject.
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Ordered server policies.
    #[serde(default)]
    pub servers: Vec<ServerPolicy>,
}

fn default_data_dir() -> String {
    ".quill".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Policy {
    /// A starter policy: version 1, allow every server, no tool rules.
    fn default() -> Self {
        Self {
            version: 1,
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            rate_limit: None,
            servers: vec![ServerPolicy {
                server: "*".to_string(),
                default_action: Action::Allow,
                tools: Vec::new(),
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Audit record
// ---------------------------------------------------------------------------

/// One signed, hash-chained entry in the audit ledger.
///
/// The signature covers the canonical serialization of every field except
/// `id` (assigned by the store) and `signature` itself. `prev_hash` is the
/// SHA-256 hex of the previous record's signature, or the empty string for
/// the first record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Store-assigned id, monotonic in append order.
    pub id: i64,
    /// RFC 3339 timestamp captured at signing time.
    pub timestamp: String,
    /// Name of the mediated tool server.
    pub server_name: String,
    /// Whether this entry records a request or a response.
    pub direction: Direction,
    /// JSON-RPC method string (`"unknown"` when the message failed to parse).
    pub method: String,
    /// String-coerced JSON-RPC message id, if any.
    pub message_id: Option<String>,
    /// Tool name for `tools/call` requests.
    pub tool_name: Option<String>,
    /// Raw arguments JSON text, preserved byte-for-byte.
    pub arguments: Option<String>,
    /// Raw response JSON text, preserved byte-for-byte.
    pub response: Option<String>,
    /// Decision recorded for this message.
    pub verdict: Verdict,
    /// Risk score 0–100, present only for evaluated tool calls.
    pub risk_score: Option<u8>,
    /// Risk level matching `risk_score`.
    pub risk_level: Option<RiskLevel>,
    /// SHA-256 hex of the canonical policy in force at signing time.
    pub policy_hash: String,
    /// SHA-256 hex of the previous record's signature; `""` for the first.
    pub prev_hash: String,
    /// Per-record unique token (UUIDv4) to defeat signature replay.
    pub nonce: String,
    /// Hex Ed25519 signature over the canonical signable view.
    pub signature: String,
    /// PEM of the signing public key.
    pub public_key: String,
}

impl AuditRecord {
    /// The view of this record that is signed: every field except `id` and
    /// `signature`, as a JSON object suitable for canonical serialization.
    pub fn signable_view(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.timestamp,
            "server_name": self.server_name,
            "direction": self.direction,
            "method": self.method,
            "message_id": self.message_id,
            "tool_name": self.tool_name,
            "arguments": self.arguments,
            "response": self.response,
            "verdict": self.verdict,
            "risk_score": self.risk_score,
            "risk_level": self.risk_level,
            "policy_hash": self.policy_hash,
            "prev_hash": self.prev_hash,
            "nonce": self.nonce,
            "public_key": self.public_key,
        })
    }
}

// ---------------------------------------------------------------------------
// API keys & sessions
// ---------------------------------------------------------------------------

/// Stored API key record. The raw secret is never persisted; only its
/// SHA-256 hex digest is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Short public handle, prefixed `qk_`.
    pub id: String,
    /// SHA-256 hex of the raw secret.
    pub key_hash: String,
    /// Operator-assigned owner id.
    pub owner: String,
    /// Human-readable label.
    pub label: String,
    /// Comma-joined scopes.
    pub scopes: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 expiry, if any.
    pub expires_at: Option<String>,
    /// Whether the key has been revoked.
    pub revoked: bool,
    /// Per-key requests-per-minute override.
    pub rate_limit_rpm: Option<u32>,
}

/// An issued bearer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session token.
    pub token: String,
    /// Principal this session acts as.
    pub subject: String,
    /// How the session was established (e.g. `"api_key"`).
    pub auth_method: String,
    /// Comma-joined scopes.
    pub scopes: String,
    /// RFC 3339 issue time.
    pub issued_at: String,
    /// RFC 3339 expiry.
    pub expires_at: String,
    /// Whether the session has been revoked.
    pub revoked: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Core error type shared across Quill components.
#[derive(thiserror::Error, Debug)]
pub enum QuillError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Canonicalization error: {0}")]
    Canonical(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QuillError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
