//! Declarative policy evaluation for Quill.
//!
//! A policy is an ordered list of server entries, each with an ordered list
//! of tool rules. Evaluation is first-match-wins at both levels and fails
//! closed: a request whose server matches no entry is denied.

use quill_core::{Action, Policy, Verdict};
use regex::Regex;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

/// Translate a glob pattern to an anchored regex: `*` matches any run of
/// characters, `?` matches exactly one, everything else is literal.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Case-sensitive glob match. An empty pattern matches only the empty string.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    Regex::new(&glob_to_regex(pattern))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate the policy for one message.
///
/// 1. The first server entry whose pattern matches `server_name` is
///    selected; no match means `deny` (fail closed).
/// 2. Non-tool-call messages (`tool_name == None`) pass through.
/// 3. The first tool rule whose pattern matches returns its action;
///    otherwise the server's default action applies.
pub fn evaluate(policy: &Policy, server_name: &str, tool_name: Option<&str>) -> Verdict {
    let Some(server) = policy
        .servers
        .iter()
        .find(|entry| glob_match(&entry.server, server_name))
    else {
        return Verdict::Deny;
    };

    let Some(tool) = tool_name else {
        return Verdict::Passthrough;
    };

    let action = server
        .tools
        .iter()
        .find(|rule| glob_match(&rule.tool, tool))
        .map(|rule| rule.action)
        .unwrap_or(server.default_action);

    match action {
        Action::Allow => Verdict::Allow,
        Action::Deny => Verdict::Deny,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a raw policy document before deserialization, returning every
/// problem found (empty for a valid document).
///
/// Hand-edited `policy.json` files get an error list instead of the first
/// serde failure.
pub fn validate_document(doc: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(obj) = doc.as_object() else {
        return vec!["policy must be a JSON object".to_string()];
    };

    match obj.get("version").and_then(Value::as_i64) {
        Some(1) => {}
        Some(other) => errors.push(format!("unsupported policy version {other}; expected 1")),
        None => errors.push("missing or non-integer 'version'".to_string()),
    }

    let Some(servers) = obj.get("servers") else {
        errors.push("missing 'servers' array".to_string());
        return errors;
    };
    let Some(servers) = servers.as_array() else {
        errors.push("'servers' must be an array".to_string());
        return errors;
    };

    for (i, server) in servers.iter().enumerate() {
        let Some(server) = server.as_object() else {
            errors.push(format!("servers[{i}] must be an object"));
            continue;
        };
        match server.get("server").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => {}
            Some(_) => errors.push(format!("servers[{i}].server must not be empty")),
            None => errors.push(format!("servers[{i}] missing 'server' name")),
        }
        if let Some(action) = server.get("default_action") {
            if !is_action_literal(action) {
                errors.push(format!(
                    "servers[{i}].default_action must be \"allow\" or \"deny\""
                ));
            }
        } else {
            errors.push(format!("servers[{i}] missing 'default_action'"));
        }

        let Some(tools) = server.get("tools") else {
            continue; // tools defaults to an empty list
        };
        let Some(tools) = tools.as_array() else {
            errors.push(format!("servers[{i}].tools must be an array"));
            continue;
        };
        for (j, rule) in tools.iter().enumerate() {
            let Some(rule) = rule.as_object() else {
                errors.push(format!("servers[{i}].tools[{j}] must be an object"));
                continue;
            };
            match rule.get("tool").and_then(Value::as_str) {
                Some(pattern) if !pattern.is_empty() => {}
                Some(_) => errors.push(format!(
                    "servers[{i}].tools[{j}].tool must not be empty"
                )),
                None => errors.push(format!("servers[{i}].tools[{j}] missing 'tool' pattern")),
            }
            match rule.get("action") {
                Some(action) if is_action_literal(action) => {}
                Some(_) => errors.push(format!(
                    "servers[{i}].tools[{j}].action must be \"allow\" or \"deny\""
                )),
                None => errors.push(format!("servers[{i}].tools[{j}] missing 'action'")),
            }
        }
    }

    errors
}

fn is_action_literal(value: &Value) -> bool {
    matches!(value.as_str(), Some("allow") | Some("deny"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
