//! Built-in risk pattern and keyword tables.

use quill_core::{QuillError, Result};
use quill_policy::glob_match;
use regex::Regex;

/// A tool-name glob mapped to a base risk score.
#[derive(Debug, Clone)]
pub struct RiskPattern {
    pub pattern: String,
    pub base: u8,
}

/// A compiled argument keyword with its additive boost.
pub struct KeywordBoost {
    pub regex: Regex,
    pub boost: u8,
    pub label: &'static str,
}

/// Base score when no pattern matches the tool name.
pub const DEFAULT_BASE: u8 = 20;

/// Built-in tool-name patterns, consulted in order after any custom ones.
/// First match wins.
const DEFAULT_PATTERNS: &[(&str, u8)] = &[
    ("Delete*", 80),
    ("Remove*", 80),
    ("Rm*", 80),
    ("*Shell*", 75),
    ("*Bash*", 75),
    ("*Execute*", 70),
    ("*Run*", 65),
    ("*Command*", 65),
    ("*Sql*", 60),
    ("*Database*", 55),
    ("Write*", 50),
    ("Update*", 45),
    ("Edit*", 45),
    ("Create*", 40),
    ("*Query*", 40),
    ("*Fetch*", 35),
    ("*Http*", 35),
    ("*Request*", 35),
    ("Read*", 10),
    ("Search*", 10),
    ("Get*", 5),
];

/// Argument keywords: `(pattern, boost, label)`. All are compiled
/// case-insensitive; word boundaries keep `delete` from firing inside
/// `undeleted`.
const KEYWORD_TABLE: &[(&str, u8, &str)] = &[
    (r"\brm\s+-rf\b", 30, "rm -rf"),
    (r"\bdrop\b", 25, "drop"),
    (r"\btruncate\b", 25, "truncate"),
    (r"\bdelete\b", 20, "delete"),
    (r"\bformat\b", 20, "format"),
    (r"\b(sudo|chmod|chown)\b", 20, "privilege escalation"),
    (r"\bpassword\b", 15, "password"),
    (r"\bsecret\b", 15, "secret"),
    (r"(\.env\b|\bcredentials\b)", 15, "credential file"),
    (r"\btoken\b", 10, "token"),
];

/// Resolve the base score for a tool name: custom patterns first, then the
/// built-in table, then [`DEFAULT_BASE`]. Returns the score and a reason.
pub(crate) fn base_score(tool_name: &str, custom: &[RiskPattern]) -> (u8, String) {
    for pattern in custom {
        if glob_match(&pattern.pattern, tool_name) {
            return (
                pattern.base,
                format!(
                    "tool name matches custom pattern '{}' (base {})",
                    pattern.pattern, pattern.base
                ),
            );
        }
    }
    for (pattern, base) in DEFAULT_PATTERNS {
        if glob_match(pattern, tool_name) {
            return (
                *base,
                format!("tool name matches '{pattern}' (base {base})"),
            );
        }
    }
    (
        DEFAULT_BASE,
        format!("no pattern match (base {DEFAULT_BASE})"),
    )
}

/// Compile the keyword table.
pub(crate) fn compile_keyword_boosts() -> Result<Vec<KeywordBoost>> {
    KEYWORD_TABLE
        .iter()
        .map(|(pattern, boost, label)| {
            let regex = Regex::new(&format!("(?i){pattern}")).map_err(|e| {
                QuillError::Policy(format!("Failed to compile keyword '{label}': {e}"))
            })?;
            Ok(KeywordBoost {
                regex,
                boost: *boost,
                label: *label,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_bands() {
        assert_eq!(base_score("DeleteFile", &[]).0, 80);
        assert_eq!(base_score("RunShellCommand", &[]).0, 75);
        assert_eq!(base_score("ExecuteScript", &[]).0, 70);
        assert_eq!(base_score("SqlQuery", &[]).0, 60);
        assert_eq!(base_score("WriteFile", &[]).0, 50);
        assert_eq!(base_score("FetchUrl", &[]).0, 35);
        assert_eq!(base_score("ReadFile", &[]).0, 10);
        assert_eq!(base_score("GetUser", &[]).0, 5);
    }

    #[test]
    fn test_first_match_wins_in_table_order() {
        // "DeleteDatabaseRow" matches Delete* (80) before *Database* (55)
        assert_eq!(base_score("DeleteDatabaseRow", &[]).0, 80);
        // "RunSqlQuery" matches *Run* (65) before *Sql* and *Query*
        assert_eq!(base_score("RunSqlQuery", &[]).0, 65);
    }

    #[test]
    fn test_default_base_for_unknown_shapes() {
        let (base, reason) = base_score("mystery_tool", &[]);
        assert_eq!(base, DEFAULT_BASE);
        assert!(reason.contains("no pattern match"));
    }

    #[test]
    fn test_custom_patterns_checked_first() {
        let custom = vec![RiskPattern {
            pattern: "mystery_*".to_string(),
            base: 90,
        }];
        assert_eq!(base_score("mystery_tool", &custom).0, 90);
        // Non-matching tools still fall through to the built-ins
        assert_eq!(base_score("ReadFile", &custom).0, 10);
    }

    #[test]
    fn test_keyword_table_compiles() {
        let keywords = compile_keyword_boosts().unwrap();
        assert_eq!(keywords.len(), KEYWORD_TABLE.len());
        for keyword in &keywords {
            assert!((10..=30).contains(&keyword.boost));
        }
    }

    #[test]
    fn test_keyword_word_boundaries() {
        let keywords = compile_keyword_boosts().unwrap();
        let delete = keywords.iter().find(|k| k.label == "delete").unwrap();
        assert!(delete.regex.is_match("DELETE FROM users"));
        assert!(!delete.regex.is_match("undeleted"));

        let env = keywords
            .iter()
            .find(|k| k.label == "credential file")
            .unwrap();
        assert!(env.regex.is_match("cat /app/.env"));
        assert!(env.regex.is_match("read credentials.json"));
        assert!(!env.regex.is_match("environment"));
    }
}
