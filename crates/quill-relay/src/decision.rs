//! The per-message decision loop shared by both transports.
//!
//! Order of operations for every inbound message: classify, evaluate policy,
//! score risk (tool calls only), append the request record, and either
//! forward or synthesize a denial. Forwarding only ever happens after the
//! decision completes; ledger write failures are logged and counted but
//! never block the pipeline.

use crate::interceptor::{self, Intercepted};
use quill_core::{Policy, Verdict};
use quill_risk::{RiskEngine, RiskScore, RiskVerdict};
use quill_storage::{AuditLogger, RecordDraft};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// JSON-RPC error code used for policy and risk denials.
pub const DENY_ERROR_CODE: i64 = -32600;

/// Error message carried by synthesized denial responses.
pub const DENY_ERROR_MESSAGE: &str = "tool call denied by policy";

/// Consecutive ledger failures before the error log escalates.
const LEDGER_FAILURE_ALERT_AFTER: u32 = 3;

/// What the transport should do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Forward the original bytes upstream.
    Forward,
    /// Return this synthesized JSON-RPC error to the caller instead.
    Deny { response: String },
}

/// The decision core: policy, risk, and the audit logger, bound to one
/// mediated server.
pub struct DecisionCore {
    server_name: String,
    policy: Arc<Policy>,
    risk: Arc<RiskEngine>,
    logger: Arc<AuditLogger>,
    ledger_failures: AtomicU32,
}

impl DecisionCore {
    pub fn new(
        server_name: impl Into<String>,
        policy: Arc<Policy>,
        risk: Arc<RiskEngine>,
        logger: Arc<AuditLogger>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            policy,
            risk,
            logger,
            ledger_failures: AtomicU32::new(0),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn logger(&self) -> &AuditLogger {
        &self.logger
    }

    /// Decide one inbound message for `subject`.
    pub async fn decide(&self, raw: &str, subject: &str) -> Outcome {
        let intercepted = interceptor::classify(raw);

        match intercepted {
            Intercepted::ParseFailed => {
                // Never drop a message over a parse failure; record and relay.
                self.append(
                    RecordDraft::request(&self.server_name, interceptor::UNKNOWN_METHOD)
                        .with_verdict(Verdict::Passthrough),
                )
                .await;
                Outcome::Forward
            }

            Intercepted::NonRequest { message_id } => {
                self.decide_non_tool_call("response", message_id, None).await
            }

            Intercepted::Request {
                method,
                message_id,
                id_value,
            } => {
                self.decide_non_tool_call(&method, message_id, id_value)
                    .await
            }

            Intercepted::ToolCall {
                method,
                message_id,
                id_value,
                tool,
                arguments,
            } => {
                self.decide_tool_call(&method, message_id, id_value, &tool, arguments, subject)
                    .await
            }
        }
    }

    async fn decide_non_tool_call(
        &self,
        method: &str,
        message_id: Option<String>,
        id_value: Option<Value>,
    ) -> Outcome {
        let verdict = quill_policy::evaluate(&self.policy, &self.server_name, None);
        if verdict == Verdict::Deny {
            return self
                .deny(method, message_id, id_value, None, None, None)
                .await;
        }

        self.append(
            RecordDraft::request(&self.server_name, method)
                .with_message_id(message_id)
                .with_verdict(Verdict::Passthrough),
        )
        .await;
        Outcome::Forward
    }

    async fn decide_tool_call(
        &self,
        method: &str,
        message_id: Option<String>,
        id_value: Option<Value>,
        tool: &str,
        arguments: Option<String>,
        subject: &str,
    ) -> Outcome {
        let verdict = quill_policy::evaluate(&self.policy, &self.server_name, Some(tool));
        if verdict == Verdict::Deny {
            return self
                .deny(method, message_id, id_value, Some(tool), arguments, None)
                .await;
        }

        // Policy allowed the call; the risk engine may still veto it.
        let risk_score = match self
            .risk
            .score(tool, arguments.as_deref(), subject)
            .await
        {
            Ok(score) => Some(score),
            Err(e) => {
                // Risk scoring is advisory once policy has allowed the call;
                // a scoring failure must not take the pipeline down.
                error!(tool, "Risk scoring failed: {e}");
                None
            }
        };

        if let Some(ref score) = risk_score {
            match self.risk.evaluate(score) {
                RiskVerdict::Deny => {
                    return self
                        .deny(
                            method,
                            message_id,
                            id_value,
                            Some(tool),
                            arguments,
                            risk_score.clone(),
                        )
                        .await;
                }
                RiskVerdict::Flag => {
                    warn!(
                        tool,
                        subject,
                        score = score.score,
                        reasons = ?score.reasons,
                        "High-risk tool call flagged"
                    );
                }
                RiskVerdict::Allow => {}
            }
        }

        let mut draft = RecordDraft::request(&self.server_name, method)
            .with_message_id(message_id)
            .with_tool(tool, arguments)
            .with_verdict(Verdict::Allow);
        if let Some(score) = risk_score {
            draft = draft.with_risk(score.score, score.level);
        }
        self.append(draft).await;
        Outcome::Forward
    }

    /// Synthesize a denial: record the request and the synthetic response,
    /// both with `verdict=deny`, and hand the response back to the caller.
    async fn deny(
        &self,
        method: &str,
        message_id: Option<String>,
        id_value: Option<Value>,
        tool: Option<&str>,
        arguments: Option<String>,
        risk_score: Option<RiskScore>,
    ) -> Outcome {
        let response = deny_response(id_value);

        let mut request_draft = RecordDraft::request(&self.server_name, method)
            .with_message_id(message_id.clone())
            .with_verdict(Verdict::Deny);
        if let Some(tool) = tool {
            request_draft = request_draft.with_tool(tool, arguments);
        }
        let mut response_draft = RecordDraft::response(&self.server_name, method)
            .with_message_id(message_id)
            .with_response_body(response.clone())
            .with_verdict(Verdict::Deny);
        if let Some(score) = risk_score {
            request_draft = request_draft.with_risk(score.score, score.level);
            response_draft = response_draft.with_risk(score.score, score.level);
        }

        self.append(request_draft).await;
        self.append(response_draft).await;

        Outcome::Deny { response }
    }

    /// Record one upstream reply and pass it along.
    pub async fn record_response(&self, raw: &str) {
        let intercepted = interceptor::classify(raw);
        let method = intercepted.method().to_string();
        let message_id = intercepted.message_id().map(|s| s.to_string());

        self.append(
            RecordDraft::response(&self.server_name, method)
                .with_message_id(message_id)
                .with_response_body(raw)
                .with_verdict(Verdict::Passthrough),
        )
        .await;
    }

    /// Record a request rejected by the rate limiter before evaluation.
    pub async fn record_rate_limited(&self, raw: &str) {
        let intercepted = interceptor::classify(raw);
        let method = intercepted.method().to_string();
        let message_id = intercepted.message_id().map(|s| s.to_string());

        self.append(
            RecordDraft::request(&self.server_name, method)
                .with_message_id(message_id)
                .with_verdict(Verdict::RateLimited),
        )
        .await;
    }

    /// Append one record, absorbing storage failures: the audit trail must
    /// not break the data stream. Repeated failures escalate the log so a
    /// persistent storage problem is visible on stderr.
    async fn append(&self, draft: RecordDraft) {
        match self.logger.append(draft).await {
            Ok(_) => {
                self.ledger_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.ledger_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= LEDGER_FAILURE_ALERT_AFTER {
                    error!(
                        consecutive_failures = failures,
                        "Audit ledger writes are failing persistently: {e}"
                    );
                } else {
                    error!("Audit ledger write failed: {e}");
                }
            }
        }
    }
}

/// Build the synthesized JSON-RPC denial response, echoing the original id.
fn deny_response(id_value: Option<Value>) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id_value.unwrap_or(Value::Null),
        "error": {
            "code": DENY_ERROR_CODE,
            "message": DENY_ERROR_MESSAGE,
        }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
