//! # TaskPilot Core
//!
//! Domain types, traits, and error definitions for the TaskPilot work-item
//! scheduler. This crate has **no runtime components** — it defines the
//! domain model that the admission, guard, tools and workflow crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`Backend`] — a tool back end exposing named operations
//! - [`Reasoner`] — the shared reasoning service (plan, verify, adjust, replan)
//! - [`ApprovalGate`] — confirmation signal for guarded invocations
//! - [`EscalationPolicy`] — outside "should we replan" gating
//!
//! Implementations live in their respective crates or in the embedding
//! application, which keeps every stage testable with scripted stubs.

pub mod backend;
pub mod collaborator;
pub mod error;
pub mod event;
pub mod item;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use backend::{
    Backend, BackendFailure, BackendRegistry, FailureReason, OperationSpec, Parameters,
};
pub use collaborator::{
    AllowAll, ApprovalGate, ApprovalRequest, DefaultEscalationPolicy, DenyAll, EscalationPolicy,
    ItemPlan, ReplanDecision, ReplannedItem, Reasoner, Verification,
};
pub use error::{CollaboratorError, Error, ItemError, Result};
pub use event::{EventBus, WorkflowEvent};
pub use item::{Evidence, EvidenceKind, ItemId, ItemSpec, ItemStatus, WorkItem};
pub use tool::{ToolInvocation, ToolPlan};
