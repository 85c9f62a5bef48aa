//! Workflow engine — drives work items from `Pending` to a terminal status.
//!
//! The [`WorkflowDriver`] validates a workflow definition and runs its
//! items in dependency order, at most `max_parallel_items` at a time.
//! Each item is driven by an [`ItemStateMachine`] through planning,
//! catalogue selection, tool planning, guarded execution, verification
//! and the adjust/replan branches. Progress is published on the
//! [`EventBus`](taskpilot_core::EventBus) held by [`WorkflowServices`].

pub mod driver;
pub mod error;
pub mod machine;
pub mod report;
pub mod services;

#[cfg(test)]
mod testing;

pub use driver::WorkflowDriver;
pub use error::WorkflowError;
pub use machine::{ItemOutcome, ItemStateMachine};
pub use report::{ItemReport, WorkflowReport};
pub use services::WorkflowServices;
