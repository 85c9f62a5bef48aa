//! Work items — the schedulable unit tracked by the item state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::collaborator::{ItemPlan, ReplannedItem};
use crate::error::ItemError;

/// Stable ordinal identifying a work item. Replans allocate a fresh one.
pub type ItemId = u64;

/// Maximum number of back ends a single item may be bound to.
pub const MAX_ALLOWED_BACKENDS: usize = 2;

/// Lifecycle status of a work item.
///
/// Transitions form a DAG with two terminal classes: success
/// (`Succeeded`) and non-recoverable (`Skipped`, `Aborted`). Nothing
/// re-enters `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Planning,
    Selecting,
    ToolPlanning,
    Executing,
    Verifying,
    Succeeded,
    Adjusting,
    Replanning,
    Skipped,
    Aborted,
}

impl ItemStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Succeeded | ItemStatus::Skipped | ItemStatus::Aborted
        )
    }

    pub fn is_success(self) -> bool {
        self == ItemStatus::Succeeded
    }

    /// The transition table.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::{
            Aborted, Adjusting, Executing, Pending, Planning, Replanning, Selecting, Skipped,
            Succeeded, ToolPlanning, Verifying,
        };

        if self.is_terminal() {
            return false;
        }
        if next == Aborted {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Planning)
                | (Pending, Skipped)
                | (Planning, Selecting)
                | (Selecting, ToolPlanning)
                | (ToolPlanning, Executing)
                | (ToolPlanning, Replanning)
                | (Executing, Verifying)
                | (Executing, Adjusting)
                | (Executing, Replanning)
                | (Verifying, Succeeded)
                | (Verifying, Adjusting)
                | (Verifying, Replanning)
                | (Adjusting, ToolPlanning)
                | (Replanning, Planning)
                | (Replanning, Skipped)
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "Pending",
            ItemStatus::Planning => "Planning",
            ItemStatus::Selecting => "Selecting",
            ItemStatus::ToolPlanning => "ToolPlanning",
            ItemStatus::Executing => "Executing",
            ItemStatus::Verifying => "Verifying",
            ItemStatus::Succeeded => "Succeeded",
            ItemStatus::Adjusting => "Adjusting",
            ItemStatus::Replanning => "Replanning",
            ItemStatus::Skipped => "Skipped",
            ItemStatus::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// The external work-item record produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSpec {
    pub id: ItemId,

    /// Description of the work (opaque to the scheduler)
    pub action: String,

    /// Back ends this item may use (1–2 names)
    pub allowed_backends: Vec<String>,

    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub success_criteria: String,

    /// Items that must succeed first. Back-references only.
    #[serde(default)]
    pub dependencies: Vec<ItemId>,
}

/// What produced a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Plan,
    Execution,
    Guard,
    Verification,
}

/// One append-only evidence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    /// Attempt counter at the time of recording
    pub attempt: u32,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A work item and its mutable progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,

    /// Id of the first item in this item's replan lineage
    pub origin: ItemId,

    pub action: String,

    /// Fixed for the lifetime of the item
    allowed_backends: BTreeSet<String>,

    pub parameters: serde_json::Map<String, serde_json::Value>,

    pub success_criteria: String,

    pub dependencies: BTreeSet<ItemId>,

    status: ItemStatus,

    attempt: u32,

    evidence: Vec<Evidence>,

    /// Notes from the planning stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ItemPlan>,

    /// Set when a replan retired this item in favour of a successor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<ItemId>,
}

impl WorkItem {
    /// Build a pending item from its external record.
    pub fn new(spec: ItemSpec) -> Result<Self, ItemError> {
        let allowed_backends = validate_backends(spec.id, &spec.allowed_backends)?;

        if let Some(dep) = spec.dependencies.iter().find(|d| **d >= spec.id) {
            return Err(ItemError::InvalidDefinition {
                item: spec.id,
                reason: format!("dependency {dep} is not a back-reference"),
            });
        }

        Ok(Self {
            id: spec.id,
            origin: spec.id,
            action: spec.action,
            allowed_backends,
            parameters: spec.parameters,
            success_criteria: spec.success_criteria,
            dependencies: spec.dependencies.into_iter().collect(),
            status: ItemStatus::Pending,
            attempt: 0,
            evidence: Vec::new(),
            plan: None,
            superseded_by: None,
        })
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn allowed_backends(&self) -> &BTreeSet<String> {
        &self.allowed_backends
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    /// Move to `next`, enforcing the transition table.
    pub fn transition(&mut self, next: ItemStatus) -> Result<(), ItemError> {
        if !self.status.can_transition_to(next) {
            return Err(ItemError::InvalidTransition {
                item: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Start another adjust cycle. Returns the new attempt number.
    pub fn begin_adjustment(&mut self) -> Result<u32, ItemError> {
        if self.status != ItemStatus::Adjusting {
            return Err(ItemError::InvalidTransition {
                item: self.id,
                from: self.status,
                to: ItemStatus::Adjusting,
            });
        }
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Append evidence stamped with the current attempt.
    pub fn record(&mut self, kind: EvidenceKind, detail: serde_json::Value) {
        self.evidence.push(Evidence {
            kind,
            attempt: self.attempt,
            detail,
            recorded_at: Utc::now(),
        });
    }

    /// Evidence produced during the current attempt.
    pub fn current_evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.evidence.iter().filter(move |e| e.attempt == self.attempt)
    }

    /// Retire this item and build its replacement.
    ///
    /// Only valid while `Replanning`. The successor gets `new_id`, starts in
    /// `Planning` with `attempt = 0` and inherits the lineage origin and
    /// dependencies. It keeps the back-end set unless the replan names a
    /// new one.
    pub fn successor(&mut self, new_id: ItemId, replan: ReplannedItem) -> Result<WorkItem, ItemError> {
        if !self.status.can_transition_to(ItemStatus::Planning)
            || self.status != ItemStatus::Replanning
        {
            return Err(ItemError::InvalidTransition {
                item: self.id,
                from: self.status,
                to: ItemStatus::Planning,
            });
        }

        let allowed_backends = match replan.allowed_backends {
            Some(names) => validate_backends(new_id, &names)?,
            None => self.allowed_backends.clone(),
        };

        self.superseded_by = Some(new_id);

        Ok(WorkItem {
            id: new_id,
            origin: self.origin,
            action: replan.action,
            allowed_backends,
            parameters: replan.parameters,
            success_criteria: replan
                .success_criteria
                .unwrap_or_else(|| self.success_criteria.clone()),
            dependencies: self.dependencies.clone(),
            status: ItemStatus::Planning,
            attempt: 0,
            evidence: Vec::new(),
            plan: None,
            superseded_by: None,
        })
    }
}

fn validate_backends(item: ItemId, names: &[String]) -> Result<BTreeSet<String>, ItemError> {
    let set: BTreeSet<String> = names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();

    if set.is_empty() || set.len() > MAX_ALLOWED_BACKENDS || set.len() != names.len() {
        return Err(ItemError::InvalidDefinition {
            item,
            reason: format!(
                "expected 1-{MAX_ALLOWED_BACKENDS} distinct back ends, got {names:?}"
            ),
        });
    }
    Ok(set)
}
