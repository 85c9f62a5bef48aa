//! Loop guard engine.
//!
//! The engine inspects proposed invocations against per-session
//! repetition state and returns the findings the executor must obey.

use crate::model::{
    APPROVAL_CONFIDENCE, DENY_CONFIDENCE, Finding, FindingKind, GuardRule, InspectionContext,
    RepetitionRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use taskpilot_config::GuardConfig;
use taskpilot_core::{ItemId, ToolInvocation};
use tracing::{debug, info, warn};

/// An entry in the guard's findings log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardLogEntry {
    pub session: String,
    pub item: Option<ItemId>,
    pub finding: Finding,
    pub timestamp: DateTime<Utc>,
}

/// The loop guard.
///
/// Thread-safe. One instance is shared by every item of a workflow;
/// inspection of a list is serialized so run counters see invocations in
/// list order.
pub struct LoopGuard {
    config: GuardConfig,
    sessions: Mutex<HashMap<String, RepetitionRecord>>,
    /// Findings log (bounded to `max_log_entries`).
    log: Mutex<VecDeque<GuardLogEntry>>,
}

impl LoopGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Inspect invocations in order. Returns one findings list per
    /// invocation, in the same order; an empty list means "allowed".
    pub fn inspect(
        &self,
        invocations: &[ToolInvocation],
        ctx: &InspectionContext,
    ) -> Vec<Vec<Finding>> {
        if !self.config.enabled {
            return vec![Vec::new(); invocations.len()];
        }

        let mut sessions = lock(&self.sessions);
        let record = sessions.entry(ctx.session.clone()).or_default();

        let mut results = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let findings = self.check(record, invocation);

            // State moves forward whatever the outcome
            let run = record.prospective_run(&invocation.canonical_key());
            record.observe(invocation.canonical_key(), invocation.operation_key(), run);

            for finding in &findings {
                self.report(ctx, finding);
            }
            results.push(findings);
        }
        results
    }

    fn check(&self, record: &RepetitionRecord, invocation: &ToolInvocation) -> Vec<Finding> {
        let key = invocation.canonical_key();
        let run = record.prospective_run(&key);

        if run > self.config.consecutive_threshold {
            return vec![Finding {
                kind: FindingKind::Deny,
                rule: GuardRule::ConsecutiveRepetition,
                confidence: DENY_CONFIDENCE,
                backend: invocation.backend.clone(),
                operation: invocation.operation.clone(),
                canonical_key: key,
                message: format!(
                    "{invocation} repeated with identical parameters {run} times in a row (limit {})",
                    self.config.consecutive_threshold
                ),
            }];
        }

        let count = record.count(&invocation.backend, &invocation.operation);
        if count >= self.config.cumulative_ceiling {
            return vec![Finding {
                kind: FindingKind::RequireApproval,
                rule: GuardRule::CumulativeCeiling,
                confidence: APPROVAL_CONFIDENCE,
                backend: invocation.backend.clone(),
                operation: invocation.operation.clone(),
                canonical_key: key,
                message: format!(
                    "{invocation} already called {count} times this session (ceiling {})",
                    self.config.cumulative_ceiling
                ),
            }];
        }

        Vec::new()
    }

    fn report(&self, ctx: &InspectionContext, finding: &Finding) {
        match finding.kind {
            FindingKind::Deny => warn!(
                session = %ctx.session,
                item = ?ctx.item,
                backend = %finding.backend,
                operation = %finding.operation,
                "Loop guard DENIED invocation: {}",
                finding.message
            ),
            FindingKind::RequireApproval => info!(
                session = %ctx.session,
                item = ?ctx.item,
                backend = %finding.backend,
                operation = %finding.operation,
                "Loop guard requires APPROVAL: {}",
                finding.message
            ),
        }

        let mut log = lock(&self.log);
        log.push_back(GuardLogEntry {
            session: ctx.session.clone(),
            item: ctx.item,
            finding: finding.clone(),
            timestamp: Utc::now(),
        });
        while log.len() > self.config.max_log_entries {
            log.pop_front();
        }
    }

    /// Snapshot of one session's state.
    pub fn session(&self, session: &str) -> Option<RepetitionRecord> {
        lock(&self.sessions).get(session).cloned()
    }

    /// Drop one session's state. Returns `true` if it existed.
    pub fn reset_session(&self, session: &str) -> bool {
        let removed = lock(&self.sessions).remove(session).is_some();
        if removed {
            debug!(session, "Loop guard session reset");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Get the findings log, oldest first.
    pub fn log(&self) -> Vec<GuardLogEntry> {
        lock(&self.log).iter().cloned().collect()
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
