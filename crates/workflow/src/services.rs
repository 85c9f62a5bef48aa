//! The collaborators shared by every item of a workflow.

use std::sync::Arc;
use taskpilot_admission::AdmissionController;
use taskpilot_config::{FlowConfig, ItemConfig};
use taskpilot_core::{
    ApprovalGate, BackendRegistry, DefaultEscalationPolicy, EscalationPolicy, EventBus, Reasoner,
};
use taskpilot_guard::LoopGuard;
use taskpilot_tools::ToolExecutor;

/// Injected, internally synchronized components. One instance is shared
/// by every state machine of a run.
pub struct WorkflowServices {
    pub admission: Arc<AdmissionController>,
    pub executor: Arc<ToolExecutor>,
    pub reasoner: Arc<dyn Reasoner>,
    pub escalation: Arc<dyn EscalationPolicy>,
    pub events: Arc<EventBus>,
    pub config: ItemConfig,
}

impl WorkflowServices {
    /// Wire the standard components from a configuration.
    ///
    /// Must be called from within a Tokio runtime (the admission
    /// controller starts its dispatcher immediately).
    pub fn from_config(
        config: &FlowConfig,
        registry: BackendRegistry,
        reasoner: Arc<dyn Reasoner>,
        approvals: Arc<dyn ApprovalGate>,
    ) -> Self {
        let guard = Arc::new(LoopGuard::new(config.guard.clone()));
        let executor = ToolExecutor::new(
            Arc::new(registry),
            guard,
            approvals,
            config.executor.clone(),
        );
        Self {
            admission: Arc::new(AdmissionController::new(config.admission.clone())),
            executor: Arc::new(executor),
            reasoner,
            escalation: Arc::new(DefaultEscalationPolicy {
                max_replans: config.items.max_replans,
            }),
            events: Arc::new(EventBus::default()),
            config: config.items.clone(),
        }
    }

    /// Replace the escalation policy.
    pub fn with_escalation(mut self, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.escalation = policy;
        self
    }

    pub fn guard(&self) -> &Arc<LoopGuard> {
        self.executor.guard()
    }
}
