//! Progress events — decoupled notification of what the scheduler is doing.
//!
//! Events are published as items move through their stages. Listeners
//! subscribe to react; the scheduler never waits on them and behaves the
//! same whether anyone is listening or not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::item::{ItemId, ItemStatus};

/// All progress events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow run started
    RunStarted {
        run_id: String,
        items: usize,
        timestamp: DateTime<Utc>,
    },

    /// An item entered a stage
    StageEntered {
        item: ItemId,
        status: ItemStatus,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// An item started another adjust cycle
    AttemptIncremented {
        item: ItemId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// The loop guard flagged an invocation
    FindingEmitted {
        item: ItemId,
        backend: String,
        operation: String,
        kind: String,
        rule: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool invocation finished (or was vetoed)
    InvocationCompleted {
        item: ItemId,
        backend: String,
        operation: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An item was replaced by a replanned successor
    ItemReplanned {
        from: ItemId,
        to: ItemId,
        timestamp: DateTime<Utc>,
    },

    /// An item reached a terminal status
    ItemFinished {
        item: ItemId,
        status: ItemStatus,
        timestamp: DateTime<Utc>,
    },

    /// A workflow run finished
    RunFinished {
        run_id: String,
        succeeded: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for progress events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and lose old events; publishers never block.
pub struct EventBus {
    sender: broadcast::Sender<Arc<WorkflowEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WorkflowEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
