//! Admission control for calls to the shared reasoning service.
//!
//! The reasoning service is rate limited and slow. Every planning,
//! verification, adjustment and replanning call made by a work item is
//! submitted here instead of being issued directly:
//!
//! - **Pacing**: at most `max_concurrent` calls run at once, and admissions
//!   are spaced by an adaptive delay that shrinks on success and grows on
//!   failure.
//! - **Priority**: waiting calls are released highest priority first, FIFO
//!   within a priority.
//! - **Batching**: calls with the same batch key share one execution and
//!   all receive its result.
//! - **Backoff**: retryable failures are re-queued a bounded number of
//!   times before the caller sees an error.

mod controller;
mod error;
mod pacing;

pub use controller::{AdmissionController, AdmissionStats, SubmitOptions};
pub use error::AdmissionError;
pub use pacing::AdaptiveDelay;
