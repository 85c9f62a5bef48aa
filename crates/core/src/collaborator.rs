//! Collaborator traits — the scheduler's view of the outside world.
//!
//! The reasoning service answers planning, verification, adjustment and
//! replanning questions; what it asks the model and which model answers
//! are its own business. Every call goes through the admission controller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::OperationSpec;
use crate::error::CollaboratorError;
use crate::item::{Evidence, ItemId, WorkItem};
use crate::tool::{ToolInvocation, ToolPlan};

/// Output of the planning stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPlan {
    /// Short description of the intended approach
    pub summary: String,

    /// Free-form planner output
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Verdict of the external verifier. Authoritative for the item outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

impl Verification {
    pub fn passed(evidence: serde_json::Value) -> Self {
        Self {
            verified: true,
            evidence,
        }
    }

    pub fn failed(evidence: serde_json::Value) -> Self {
        Self {
            verified: false,
            evidence,
        }
    }
}

/// A replacement definition produced by the replanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplannedItem {
    pub action: String,

    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,

    /// Keeps the previous criteria when absent
    #[serde(default)]
    pub success_criteria: Option<String>,

    /// Keeps the previous back ends when absent
    #[serde(default)]
    pub allowed_backends: Option<Vec<String>>,
}

/// Outcome of the replanning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplanDecision {
    NewPlan(ReplannedItem),
    NoViablePlan { reason: String },
}

/// The shared reasoning service.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Plan how to approach an item.
    async fn plan_item(&self, item: &WorkItem) -> Result<ItemPlan, CollaboratorError>;

    /// Propose tool invocations using only the given catalogue.
    async fn plan_tools(
        &self,
        item: &WorkItem,
        catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError>;

    /// Judge whether the item met its success criteria.
    async fn verify(
        &self,
        item: &WorkItem,
        evidence: &[Evidence],
    ) -> Result<Verification, CollaboratorError>;

    /// Revise the tool plan after a failed verification.
    async fn adjust(
        &self,
        item: &WorkItem,
        verification: &Verification,
        catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError>;

    /// Produce a new definition for an item whose retries are exhausted.
    async fn replan(&self, item: &WorkItem) -> Result<ReplanDecision, CollaboratorError>;
}

/// A request for confirmation of a guarded invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub item: Option<ItemId>,
    pub invocation: ToolInvocation,
    pub reason: String,
}

/// External confirmation signal for `RequireApproval` findings.
///
/// Anything other than an explicit `true` counts as denial.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn confirm(&self, request: &ApprovalRequest) -> bool;
}

/// Refuses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn confirm(&self, _request: &ApprovalRequest) -> bool {
        false
    }
}

/// Approves every request. Intended for unattended demos and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl ApprovalGate for AllowAll {
    async fn confirm(&self, _request: &ApprovalRequest) -> bool {
        true
    }
}

/// Outside policy deciding whether an exhausted item may be replanned.
pub trait EscalationPolicy: Send + Sync {
    fn allow_replan(&self, item: &WorkItem, replans_so_far: u32) -> bool;
}

/// Allows a bounded number of replans per lineage.
#[derive(Debug, Clone, Copy)]
pub struct DefaultEscalationPolicy {
    pub max_replans: u32,
}

impl EscalationPolicy for DefaultEscalationPolicy {
    fn allow_replan(&self, _item: &WorkItem, replans_so_far: u32) -> bool {
        replans_so_far < self.max_replans
    }
}
