//! Heuristic risk scoring for tool calls.
//!
//! A score is the sum of three parts, clamped to 0–100:
//!
//! 1. a **base** from the first tool-name pattern that matches,
//! 2. an **argument boost** from keyword scans over the raw arguments JSON,
//! 3. a **behavior boost** from recent high-risk activity by the same
//!    subject (5 points per event inside the sliding window).
//!
//! Scoring at or above the flag threshold records a behavior event, so
//! repeated risky calls escalate.

use quill_core::{Result, RiskLevel};
use quill_storage::BehaviorStore;
use tracing::debug;

mod patterns;

pub use patterns::{KeywordBoost, RiskPattern};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thresholds and window settings for the risk engine.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Score at or above which a call is denied.
    pub deny_threshold: u8,
    /// Score at or above which a call is flagged (and a behavior event
    /// recorded).
    pub flag_threshold: u8,
    /// Sliding-window length for behavior counting, in seconds.
    pub window_secs: u64,
    /// Windowed event count at which a subject should be revoked.
    pub revoke_after: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            deny_threshold: 85,
            flag_threshold: 60,
            window_secs: 300,
            revoke_after: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Score & verdict types
// ---------------------------------------------------------------------------

/// Breakdown of one risk evaluation.
#[derive(Debug, Clone)]
pub struct RiskScore {
    /// Final clamped score, 0–100.
    pub score: u8,
    /// Base from the tool-name pattern table.
    pub base: u8,
    /// Additive boost from argument keywords.
    pub arg_boost: u8,
    /// Boost from recent behavior (`window count × 5`).
    pub behavior_boost: u8,
    /// Level derived from the final score and the configured thresholds.
    pub level: RiskLevel,
    /// Human-readable contributions, in the order applied.
    pub reasons: Vec<String>,
}

/// What the relay should do with a scored call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Allow,
    /// Forward, but warn and record the behavior event.
    Flag,
    Deny,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The risk engine: pattern tables plus the persistent behavior store.
pub struct RiskEngine {
    config: RiskConfig,
    custom_patterns: Vec<RiskPattern>,
    keywords: Vec<KeywordBoost>,
    behavior: BehaviorStore,
}

impl RiskEngine {
    /// Build an engine with the built-in tables.
    pub fn new(config: RiskConfig, behavior: BehaviorStore) -> Result<Self> {
        Ok(Self {
            config,
            custom_patterns: Vec::new(),
            keywords: patterns::compile_keyword_boosts()?,
            behavior,
        })
    }

    /// Prepend operator-supplied patterns; they are consulted before the
    /// built-in table.
    pub fn with_custom_patterns(mut self, patterns: Vec<RiskPattern>) -> Self {
        self.custom_patterns = patterns;
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Score one tool call for a subject.
    ///
    /// Side effect: at or above the flag threshold a behavior event is
    /// recorded for the subject, escalating subsequent scores inside the
    /// window.
    pub async fn score(
        &self,
        tool_name: &str,
        arguments: Option<&str>,
        subject_id: &str,
    ) -> Result<RiskScore> {
        let mut reasons = Vec::new();

        let (base, base_reason) = patterns::base_score(tool_name, &self.custom_patterns);
        reasons.push(base_reason);

        let mut arg_boost: u32 = 0;
        if let Some(args) = arguments {
            for keyword in &self.keywords {
                if keyword.regex.is_match(args) {
                    arg_boost += keyword.boost as u32;
                    reasons.push(format!(
                        "arguments match '{}' (+{})",
                        keyword.label, keyword.boost
                    ));
                }
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let cutoff_ms = now_ms - (self.config.window_secs as i64) * 1000;
        let window_count = self.behavior.count(subject_id, cutoff_ms).await?;
        let behavior_boost = (window_count as u32) * 5;
        if behavior_boost > 0 {
            reasons.push(format!(
                "{window_count} recent high-risk calls (+{behavior_boost})"
            ));
        }

        let total = (base as u32 + arg_boost + behavior_boost).min(100) as u8;
        let level = self.level_for(total);

        if total >= self.config.flag_threshold {
            self.behavior.record(subject_id, now_ms).await?;
        }

        debug!(
            tool_name,
            subject_id,
            score = total,
            base,
            arg_boost,
            behavior_boost,
            %level,
            "Scored tool call"
        );

        Ok(RiskScore {
            score: total,
            base,
            arg_boost: arg_boost.min(100) as u8,
            behavior_boost: behavior_boost.min(100) as u8,
            level,
            reasons,
        })
    }

    fn level_for(&self, score: u8) -> RiskLevel {
        if score >= self.config.deny_threshold {
            RiskLevel::Critical
        } else if score >= self.config.flag_threshold {
            RiskLevel::High
        } else if score >= 30 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Map a score to the action the relay takes.
    pub fn evaluate(&self, score: &RiskScore) -> RiskVerdict {
        if score.score >= self.config.deny_threshold {
            RiskVerdict::Deny
        } else if score.score >= self.config.flag_threshold {
            RiskVerdict::Flag
        } else {
            RiskVerdict::Allow
        }
    }

    /// Whether the subject's windowed event count has reached the
    /// revocation threshold.
    pub async fn should_revoke(&self, subject_id: &str) -> Result<bool> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let cutoff_ms = now_ms - (self.config.window_secs as i64) * 1000;
        let count = self.behavior.count(subject_id, cutoff_ms).await?;
        Ok(count >= self.config.revoke_after)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine(config: RiskConfig) -> RiskEngine {
        let behavior = BehaviorStore::new("sqlite::memory:").await.unwrap();
        RiskEngine::new(config, behavior).unwrap()
    }

    #[tokio::test]
    async fn test_read_tool_is_low_risk() {
        let engine = test_engine(RiskConfig::default()).await;
        let score = engine.score("ReadFile", None, "agent-1").await.unwrap();
        assert!(score.score <= 20);
        assert_eq!(score.level, RiskLevel::Low);
        assert_eq!(engine.evaluate(&score), RiskVerdict::Allow);
        assert_eq!(score.behavior_boost, 0);
    }

    #[tokio::test]
    async fn test_delete_tool_is_flagged() {
        let engine = test_engine(RiskConfig::default()).await;
        let score = engine.score("DeleteFile", None, "agent-1").await.unwrap();
        assert!(score.score >= 60);
        assert_eq!(score.level, RiskLevel::High);
        assert_eq!(engine.evaluate(&score), RiskVerdict::Flag);
    }

    #[tokio::test]
    async fn test_dangerous_arguments_push_to_deny() {
        let config = RiskConfig {
            deny_threshold: 70,
            ..RiskConfig::default()
        };
        let engine = test_engine(config).await;
        let score = engine
            .score("DeleteFile", Some(r#"{"cmd":"rm -rf /"}"#), "agent-1")
            .await
            .unwrap();
        assert_eq!(engine.evaluate(&score), RiskVerdict::Deny);
        assert_eq!(score.level, RiskLevel::Critical);
        assert!(score.arg_boost > 0);
        assert!(score.reasons.iter().any(|r| r.contains("rm -rf")));
    }

    #[tokio::test]
    async fn test_unmatched_tool_gets_default_base() {
        let engine = test_engine(RiskConfig::default()).await;
        let score = engine
            .score("SomethingNovel", None, "agent-1")
            .await
            .unwrap();
        assert_eq!(score.base, 20);
        assert_eq!(score.level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_keyword_boosts_stack() {
        let engine = test_engine(RiskConfig::default()).await;
        let score = engine
            .score(
                "RunQuery",
                Some(r#"{"sql":"DROP TABLE users; TRUNCATE logs"}"#),
                "agent-1",
            )
            .await
            .unwrap();
        // drop (25) + truncate (25) stack on top of the base
        assert!(score.arg_boost >= 50);
    }

    #[tokio::test]
    async fn test_keyword_match_is_case_insensitive_and_word_bounded() {
        let engine = test_engine(RiskConfig::default()).await;
        let upper = engine
            .score("GetRecord", Some(r#"{"q":"DELETE FROM t"}"#), "a")
            .await
            .unwrap();
        assert!(upper.arg_boost > 0);

        // 'undeleted' must not trigger the 'delete' keyword
        let embedded = engine
            .score("GetRecord", Some(r#"{"q":"undeleted rows"}"#), "b")
            .await
            .unwrap();
        assert_eq!(embedded.arg_boost, 0);
    }

    #[tokio::test]
    async fn test_repetition_escalates_monotonically() {
        let engine = test_engine(RiskConfig::default()).await;
        let s1 = engine.score("DeleteFile", None, "agent-1").await.unwrap();
        let s2 = engine.score("DeleteFile", None, "agent-1").await.unwrap();
        let s3 = engine.score("DeleteFile", None, "agent-1").await.unwrap();

        assert!(s2.score >= s1.score);
        assert!(s3.score >= s2.score);
        assert!(s3.behavior_boost > 0);
    }

    #[tokio::test]
    async fn test_should_revoke_after_threshold() {
        let engine = test_engine(RiskConfig::default()).await;
        assert!(!engine.should_revoke("agent-1").await.unwrap());

        for _ in 0..5 {
            engine.score("DeleteFile", None, "agent-1").await.unwrap();
        }
        assert!(engine.should_revoke("agent-1").await.unwrap());
        // Other subjects are unaffected
        assert!(!engine.should_revoke("agent-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_low_risk_calls_do_not_record_behavior() {
        let engine = test_engine(RiskConfig::default()).await;
        for _ in 0..10 {
            engine.score("ReadFile", None, "agent-1").await.unwrap();
        }
        let after = engine.score("ReadFile", None, "agent-1").await.unwrap();
        assert_eq!(after.behavior_boost, 0);
    }

    #[tokio::test]
    async fn test_score_clamped_to_100() {
        let engine = test_engine(RiskConfig::default()).await;
        let score = engine
            .score(
                "DeleteEverything",
                Some(r#"{"cmd":"sudo rm -rf / --no-preserve-root; drop; truncate; format"}"#),
                "agent-1",
            )
            .await
            .unwrap();
        assert_eq!(score.score, 100);
    }

    #[tokio::test]
    async fn test_custom_patterns_take_precedence() {
        let engine = test_engine(RiskConfig::default()).await.with_custom_patterns(vec![
            RiskPattern {
                pattern: "Delete*".to_string(),
                base: 5,
            },
        ]);
        let score = engine.score("DeleteFile", None, "agent-1").await.unwrap();
        assert_eq!(score.base, 5);
    }

    #[tokio::test]
    async fn test_level_bands() {
        let engine = test_engine(RiskConfig::default()).await;
        assert_eq!(engine.level_for(10), RiskLevel::Low);
        assert_eq!(engine.level_for(30), RiskLevel::Medium);
        assert_eq!(engine.level_for(60), RiskLevel::High);
        assert_eq!(engine.level_for(85), RiskLevel::Critical);
        assert_eq!(engine.level_for(100), RiskLevel::Critical);
    }
}
