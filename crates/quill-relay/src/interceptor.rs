//! Message interception and classification.
//!
//! Every inbound line or body is classified into one of four shapes before
//! the decision loop runs. Parsing is best-effort: malformed JSON is still
//! relayed (and recorded), never dropped.

use serde_json::Value;

/// The JSON-RPC method name subject to policy evaluation.
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// Method string recorded for messages that failed to parse.
pub const UNKNOWN_METHOD: &str = "unknown";

/// Classification of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercepted {
    /// The body was not valid JSON. Forwarded unchanged.
    ParseFailed,
    /// Valid JSON without a `method` field (a response or other non-request).
    NonRequest {
        /// String-coerced `id`, if present.
        message_id: Option<String>,
    },
    /// A request (or notification) other than `tools/call`.
    Request {
        method: String,
        message_id: Option<String>,
        /// Original `id` value, preserved for synthesized replies.
        id_value: Option<Value>,
    },
    /// A `tools/call` request with its extracted tool name and arguments.
    ToolCall {
        method: String,
        message_id: Option<String>,
        id_value: Option<Value>,
        tool: String,
        /// Arguments re-serialized as compact JSON text.
        arguments: Option<String>,
    },
}

impl Intercepted {
    /// The method string to record for this message.
    pub fn method(&self) -> &str {
        match self {
            Intercepted::ParseFailed => UNKNOWN_METHOD,
            Intercepted::NonRequest { .. } => "response",
            Intercepted::Request { method, .. } => method,
            Intercepted::ToolCall { method, .. } => method,
        }
    }

    /// The string-coerced message id, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Intercepted::ParseFailed => None,
            Intercepted::NonRequest { message_id } => message_id.as_deref(),
            Intercepted::Request { message_id, .. } => message_id.as_deref(),
            Intercepted::ToolCall { message_id, .. } => message_id.as_deref(),
        }
    }
}

/// Coerce a JSON-RPC `id` to its recorded string form. Strings keep their
/// content, numbers are rendered; anything else maps to `None`.
pub fn coerce_id(id: Option<&Value>) -> Option<String> {
    match id {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Classify one raw message body.
pub fn classify(raw: &str) -> Intercepted {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Intercepted::ParseFailed;
    };
    let Some(obj) = value.as_object() else {
        return Intercepted::NonRequest { message_id: None };
    };

    let id_value = obj.get("id").cloned();
    let message_id = coerce_id(id_value.as_ref());

    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return Intercepted::NonRequest { message_id };
    };
    let method = method.to_string();

    if method == TOOLS_CALL_METHOD {
        if let Some(tool) = value
            .pointer("/params/name")
            .and_then(Value::as_str)
        {
            let arguments = value
                .pointer("/params/arguments")
                .map(|args| args.to_string());
            return Intercepted::ToolCall {
                method,
                message_id,
                id_value,
                tool: tool.to_string(),
                arguments,
            };
        }
    }

    Intercepted::Request {
        method,
        message_id,
        id_value,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_malformed_json_is_parse_failed() {
        assert_eq!(classify("{not json"), Intercepted::ParseFailed);
        assert_eq!(classify(""), Intercepted::ParseFailed);
    }

    #[test]
    fn test_non_object_json_is_non_request() {
        assert_eq!(
            classify("[1,2,3]"),
            Intercepted::NonRequest { message_id: None }
        );
    }

    #[test]
    fn test_response_is_non_request() {
        let raw = json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}}).to_string();
        assert_eq!(
            classify(&raw),
            Intercepted::NonRequest {
                message_id: Some("3".to_string())
            }
        );
    }

    #[test]
    fn test_plain_request() {
        let raw = json!({"jsonrpc": "2.0", "id": "abc", "method": "tools/list"}).to_string();
        match classify(&raw) {
            Intercepted::Request {
                method,
                message_id,
                id_value,
            } => {
                assert_eq!(method, "tools/list");
                assert_eq!(message_id.as_deref(), Some("abc"));
                assert_eq!(id_value, Some(json!("abc")));
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_call_extraction() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": "MechanicRunTool", "arguments": {"cmd": "ls"}}
        })
        .to_string();
        match classify(&raw) {
            Intercepted::ToolCall {
                method,
                message_id,
                tool,
                arguments,
                ..
            } => {
                assert_eq!(method, "tools/call");
                assert_eq!(message_id.as_deref(), Some("7"));
                assert_eq!(tool, "MechanicRunTool");
                assert_eq!(arguments.as_deref(), Some(r#"{"cmd":"ls"}"#));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_call_without_arguments() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "ListTools"}
        })
        .to_string();
        match classify(&raw) {
            Intercepted::ToolCall { arguments, .. } => assert!(arguments.is_none()),
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_call_without_name_is_plain_request() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {}
        })
        .to_string();
        assert!(matches!(classify(&raw), Intercepted::Request { .. }));
    }

    #[test]
    fn test_notification_has_no_id() {
        let raw = json!({"jsonrpc": "2.0", "method": "notifications/progress"}).to_string();
        match classify(&raw) {
            Intercepted::Request {
                message_id,
                id_value,
                ..
            } => {
                assert!(message_id.is_none());
                assert!(id_value.is_none());
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_id_coercion() {
        assert_eq!(coerce_id(Some(&json!("x"))), Some("x".to_string()));
        assert_eq!(coerce_id(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(coerce_id(Some(&json!(null))), None);
        assert_eq!(coerce_id(Some(&json!({"a": 1}))), None);
        assert_eq!(coerce_id(None), None);
    }

    #[test]
    fn test_method_accessor() {
        assert_eq!(classify("garbage").method(), "unknown");
        let resp = json!({"id": 1, "result": null}).to_string();
        assert_eq!(classify(&resp).method(), "response");
    }
}
