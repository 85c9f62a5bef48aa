//! Scripted collaborators shared by the workflow tests.

use crate::services::WorkflowServices;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use taskpilot_config::FlowConfig;
use taskpilot_core::{
    AllowAll, BackendRegistry, CollaboratorError, Evidence, ItemId, ItemPlan, ItemSpec,
    OperationSpec, ReplanDecision, Reasoner, ToolInvocation, ToolPlan, Verification, WorkItem,
};
use taskpilot_tools::MemoryBackend;
use tokio::sync::Semaphore;

pub(crate) fn spec(id: ItemId, action: &str, dependencies: &[ItemId]) -> ItemSpec {
    ItemSpec {
        id,
        action: action.into(),
        allowed_backends: vec!["memory".into()],
        parameters: Default::default(),
        success_criteria: format!("{action} done"),
        dependencies: dependencies.to_vec(),
    }
}

pub(crate) fn memory_set(key: &str, value: i64) -> ToolInvocation {
    ToolInvocation::new("memory", "set")
        .with_param("key", json!(key))
        .with_param("value", json!(value))
}

pub(crate) fn services(reasoner: ScriptedReasoner) -> WorkflowServices {
    services_with(&FlowConfig::default(), reasoner)
}

pub(crate) fn services_with(config: &FlowConfig, reasoner: ScriptedReasoner) -> WorkflowServices {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(MemoryBackend::new()));
    WorkflowServices::from_config(config, registry, Arc::new(reasoner), Arc::new(AllowAll))
}

#[derive(Default)]
struct Script {
    tools: HashMap<String, Vec<ToolInvocation>>,
    verdicts: Mutex<HashMap<String, VecDeque<bool>>>,
    replans: Mutex<VecDeque<ReplanDecision>>,
    repeat_adjustments: bool,
    planning_failure: Option<CollaboratorError>,
    /// Item planning blocks on a permit from here when set
    planning_gate: Option<Arc<Semaphore>>,
    in_planning: AtomicUsize,
    peak_planning: AtomicUsize,
    calls: Mutex<HashMap<&'static str, u32>>,
    planned: Mutex<Vec<String>>,
}

/// Reasoner answering from a script keyed by item action.
///
/// Unscripted actions get a single `memory.set` plan that verifies.
#[derive(Clone, Default)]
pub(crate) struct ScriptedReasoner {
    script: Arc<Script>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::get_mut(&mut self.script).expect("configure the script before sharing it")
    }

    pub fn with_tools(mut self, action: &str, invocations: Vec<ToolInvocation>) -> Self {
        self.script_mut().tools.insert(action.into(), invocations);
        self
    }

    pub fn with_verdicts(mut self, action: &str, verdicts: &[bool]) -> Self {
        self.script_mut()
            .verdicts
            .get_mut()
            .unwrap()
            .insert(action.into(), verdicts.iter().copied().collect());
        self
    }

    pub fn with_replan(mut self, decision: ReplanDecision) -> Self {
        self.script_mut().replans.get_mut().unwrap().push_back(decision);
        self
    }

    /// The adjuster hands back the failed plan unchanged.
    pub fn repeating_adjustments(mut self) -> Self {
        self.script_mut().repeat_adjustments = true;
        self
    }

    pub fn failing_planning(mut self, error: CollaboratorError) -> Self {
        self.script_mut().planning_failure = Some(error);
        self
    }

    /// Hold every item-planning call until `gate` hands out a permit.
    pub fn gated_planning(mut self, gate: Arc<Semaphore>) -> Self {
        self.script_mut().planning_gate = Some(gate);
        self
    }

    /// Item-planning calls currently held at the gate.
    pub fn in_planning(&self) -> usize {
        self.script.in_planning.load(Ordering::SeqCst)
    }

    /// Most item-planning calls ever held at the gate at once.
    pub fn peak_planning(&self) -> usize {
        self.script.peak_planning.load(Ordering::SeqCst)
    }

    pub fn calls(&self, stage: &str) -> u32 {
        self.script
            .calls
            .lock()
            .unwrap()
            .get(stage)
            .copied()
            .unwrap_or(0)
    }

    /// Actions in the order they were planned.
    pub fn planned(&self) -> Vec<String> {
        self.script.planned.lock().unwrap().clone()
    }

    fn count(&self, stage: &'static str) {
        *self.script.calls.lock().unwrap().entry(stage).or_insert(0) += 1;
    }

    fn tools_for(&self, action: &str) -> Vec<ToolInvocation> {
        self.script
            .tools
            .get(action)
            .cloned()
            .unwrap_or_else(|| vec![memory_set(action, 1)])
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn plan_item(&self, item: &WorkItem) -> Result<ItemPlan, CollaboratorError> {
        self.count("plan_item");
        self.script.planned.lock().unwrap().push(item.action.clone());
        if let Some(gate) = &self.script.planning_gate {
            let holding = self.script.in_planning.fetch_add(1, Ordering::SeqCst) + 1;
            self.script.peak_planning.fetch_max(holding, Ordering::SeqCst);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            self.script.in_planning.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(error) = &self.script.planning_failure {
            return Err(error.clone());
        }
        Ok(ItemPlan {
            summary: format!("do {}", item.action),
            details: json!({ "criteria": item.success_criteria }),
        })
    }

    async fn plan_tools(
        &self,
        item: &WorkItem,
        _catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError> {
        self.count("plan_tools");
        Ok(ToolPlan::new(self.tools_for(&item.action)))
    }

    async fn verify(
        &self,
        item: &WorkItem,
        evidence: &[Evidence],
    ) -> Result<Verification, CollaboratorError> {
        self.count("verify");
        let verdict = self
            .script
            .verdicts
            .lock()
            .unwrap()
            .get_mut(&item.action)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(true);
        let detail = json!({ "evidence": evidence.len() });
        Ok(if verdict {
            Verification::passed(detail)
        } else {
            Verification::failed(detail)
        })
    }

    async fn adjust(
        &self,
        item: &WorkItem,
        _failure: &Verification,
        _catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError> {
        self.count("adjust");
        let invocations = self.tools_for(&item.action);
        if self.script.repeat_adjustments {
            return Ok(ToolPlan::new(invocations));
        }
        Ok(ToolPlan::new(
            invocations
                .into_iter()
                .map(|inv| inv.with_param("attempt", json!(item.attempt())))
                .collect(),
        ))
    }

    async fn replan(&self, _item: &WorkItem) -> Result<ReplanDecision, CollaboratorError> {
        self.count("replan");
        Ok(self
            .script
            .replans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReplanDecision::NoViablePlan {
                reason: "script exhausted".into(),
            }))
    }
}
