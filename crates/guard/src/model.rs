//! Guard data model — findings, verdicts and per-session repetition state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use taskpilot_core::ItemId;

/// Confidence attached to a consecutive-repetition denial.
pub const DENY_CONFIDENCE: f32 = 1.0;

/// Confidence attached to a cumulative-ceiling approval request.
pub const APPROVAL_CONFIDENCE: f32 = 0.85;

/// What the caller must do with a flagged invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Must not be executed.
    Deny,
    /// May only be executed after an external confirmation.
    RequireApproval,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingKind::Deny => f.write_str("deny"),
            FindingKind::RequireApproval => f.write_str("require_approval"),
        }
    }
}

/// Which check produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardRule {
    ConsecutiveRepetition,
    CumulativeCeiling,
}

impl fmt::Display for GuardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRule::ConsecutiveRepetition => f.write_str("consecutive_repetition"),
            GuardRule::CumulativeCeiling => f.write_str("cumulative_ceiling"),
        }
    }
}

/// One flag raised against one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub rule: GuardRule,
    pub confidence: f32,
    pub backend: String,
    pub operation: String,
    pub canonical_key: String,
    pub message: String,
}

/// Aggregate decision for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    RequireApproval,
    Deny,
}

impl Verdict {
    /// The strictest verdict among the findings.
    pub fn from_findings(findings: &[Finding]) -> Self {
        if findings.iter().any(|f| f.kind == FindingKind::Deny) {
            Verdict::Deny
        } else if findings.iter().any(|f| f.kind == FindingKind::RequireApproval) {
            Verdict::RequireApproval
        } else {
            Verdict::Allow
        }
    }
}

/// Who is asking. Repetition state is scoped to `session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionContext {
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemId>,
}

impl InspectionContext {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            item: None,
        }
    }

    pub fn for_item(session: impl Into<String>, item: ItemId) -> Self {
        Self {
            session: session.into(),
            item: Some(item),
        }
    }
}

/// Call-pattern state for one session.
#[derive(Debug, Clone, Default)]
pub struct RepetitionRecord {
    last_key: Option<String>,
    /// Zero before the first invocation
    run_length: u32,
    counts: HashMap<(String, String), u32>,
}

impl RepetitionRecord {
    /// Run length the given key would have if it were observed next.
    pub(crate) fn prospective_run(&self, key: &str) -> u32 {
        match &self.last_key {
            Some(last) if last == key => self.run_length + 1,
            _ => 1,
        }
    }

    pub(crate) fn observe(&mut self, key: String, pair: (String, String), run: u32) {
        self.last_key = Some(key);
        self.run_length = run;
        *self.counts.entry(pair).or_insert(0) += 1;
    }

    pub fn last_key(&self) -> Option<&str> {
        self.last_key.as_deref()
    }

    pub fn run_length(&self) -> u32 {
        self.run_length
    }

    /// Lifetime count of calls to one `(backend, operation)` pair.
    pub fn count(&self, backend: &str, operation: &str) -> u32 {
        self.counts
            .get(&(backend.to_string(), operation.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(kind: FindingKind) -> Finding {
        Finding {
            kind,
            rule: GuardRule::ConsecutiveRepetition,
            confidence: DENY_CONFIDENCE,
            backend: "fs".into(),
            operation: "read_file".into(),
            canonical_key: "k".into(),
            message: String::new(),
        }
    }

    #[test]
    fn verdict_takes_strictest_finding() {
        assert_eq!(Verdict::from_findings(&[]), Verdict::Allow);
        assert_eq!(
            Verdict::from_findings(&[finding(FindingKind::RequireApproval)]),
            Verdict::RequireApproval
        );
        assert_eq!(
            Verdict::from_findings(&[
                finding(FindingKind::RequireApproval),
                finding(FindingKind::Deny)
            ]),
            Verdict::Deny
        );
    }

    #[test]
    fn empty_record_has_no_run() {
        let record = RepetitionRecord::default();
        assert_eq!(record.run_length(), 0);
        assert!(record.last_key().is_none());
        assert_eq!(record.prospective_run("a"), 1);
    }

    #[test]
    fn run_resets_on_new_key() {
        let mut record = RepetitionRecord::default();
        let pair = ("fs".to_string(), "read_file".to_string());
        record.observe("a".into(), pair.clone(), 1);
        assert_eq!(record.prospective_run("a"), 2);
        assert_eq!(record.prospective_run("b"), 1);
        record.observe("b".into(), pair, 1);
        assert_eq!(record.run_length(), 1);
        assert_eq!(record.count("fs", "read_file"), 2);
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(FindingKind::RequireApproval.to_string(), "require_approval");
        assert_eq!(GuardRule::CumulativeCeiling.to_string(), "cumulative_ceiling");
        assert_eq!(
            serde_json::to_value(FindingKind::Deny).unwrap(),
            serde_json::json!("deny")
        );
    }
}
