//! Loop guard — repetition screening for proposed tool invocations.
//!
//! Autonomous plan/adjust cycles can degenerate into calling the same
//! operation with identical arguments forever. The guard sits between the
//! tool planner and the executor and inspects every invocation *before*
//! it runs:
//!
//! - **Consecutive repetition**: the same canonical key more than
//!   `consecutive_threshold` times in a row is denied outright.
//! - **Cumulative ceiling**: once a `(backend, operation)` pair has been
//!   called `cumulative_ceiling` times in a session, every further call
//!   requires approval, whatever its parameters.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌─────────────┐
//! │  Tool plan   │───▶│  Loop Guard  │───▶│  Executor   │
//! │ (invocations)│    │  (sessions)  │    │             │
//! └──────────────┘    └──────────────┘    └─────────────┘
//!                           │
//!                     ┌─────┴──────────┐
//!                     │  Findings      │
//!                     │  Deny          │
//!                     │  RequireApproval│
//!                     └────────────────┘
//! ```

mod engine;
mod model;

pub use engine::{GuardLogEntry, LoopGuard};
pub use model::{
    APPROVAL_CONFIDENCE, DENY_CONFIDENCE, Finding, FindingKind, GuardRule, InspectionContext,
    RepetitionRecord, Verdict,
};
