//! End-to-end integration tests for the TaskPilot pipeline.
//!
//! These tests drive real workflows through the driver, the item state
//! machine, admission control, the tool executor and the loop guard,
//! against the built-in back ends. Only the reasoning service is scripted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;
use taskpilot_config::FlowConfig;
use taskpilot_core::{
    AllowAll, ApprovalGate, CollaboratorError, DenyAll, Evidence, EvidenceKind, ItemPlan,
    ItemSpec, ItemStatus, OperationSpec, ReplanDecision, ReplannedItem, Reasoner, ToolInvocation,
    ToolPlan, Verification, WorkItem,
};
use taskpilot_guard::FindingKind;
use taskpilot_tools::{InvocationRecord, default_registry};
use taskpilot_workflow::{WorkflowDriver, WorkflowServices};

// ── Scripted reasoner ────────────────────────────────────────────────────

/// Answers tool plans by action and verifies from execution evidence.
#[derive(Default)]
struct ScriptedReasoner {
    plans: HashMap<String, Vec<ToolInvocation>>,
    replans: Mutex<VecDeque<ReplannedItem>>,
    plan_calls: Mutex<usize>,
}

impl ScriptedReasoner {
    fn plan(mut self, action: &str, invocations: Vec<ToolInvocation>) -> Self {
        self.plans.insert(action.into(), invocations);
        self
    }

    fn replan_to(self, item: ReplannedItem) -> Self {
        self.replans.lock().unwrap().push_back(item);
        self
    }

    fn plan_calls(&self) -> usize {
        *self.plan_calls.lock().unwrap()
    }

    fn tools(&self, item: &WorkItem) -> ToolPlan {
        ToolPlan::new(self.plans.get(&item.action).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn plan_item(&self, item: &WorkItem) -> Result<ItemPlan, CollaboratorError> {
        *self.plan_calls.lock().unwrap() += 1;
        Ok(ItemPlan {
            summary: item.action.clone(),
            details: json!({}),
        })
    }

    async fn plan_tools(
        &self,
        item: &WorkItem,
        _catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError> {
        Ok(self.tools(item))
    }

    async fn verify(
        &self,
        _item: &WorkItem,
        evidence: &[Evidence],
    ) -> Result<Verification, CollaboratorError> {
        let all_completed = evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::Execution)
            .all(|e| {
                serde_json::from_value::<Vec<InvocationRecord>>(e.detail.clone())
                    .map(|records| records.iter().all(InvocationRecord::is_completed))
                    .unwrap_or(false)
            });
        Ok(if all_completed {
            Verification::passed(json!({}))
        } else {
            Verification::failed(json!({}))
        })
    }

    async fn adjust(
        &self,
        item: &WorkItem,
        _verification: &Verification,
        _catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError> {
        Ok(self.tools(item))
    }

    async fn replan(&self, _item: &WorkItem) -> Result<ReplanDecision, CollaboratorError> {
        Ok(match self.replans.lock().unwrap().pop_front() {
            Some(item) => ReplanDecision::NewPlan(item),
            None => ReplanDecision::NoViablePlan {
                reason: "nothing left to try".into(),
            },
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn fast_config() -> FlowConfig {
    let mut config = FlowConfig::default();
    config.admission.base_delay_ms = 1;
    config.admission.min_delay_ms = 0;
    config.admission.batch_window_ms = 20;
    config
}

fn item(id: u64, action: &str, backend: &str, dependencies: &[u64]) -> ItemSpec {
    ItemSpec {
        id,
        action: action.into(),
        allowed_backends: vec![backend.into()],
        parameters: Default::default(),
        success_criteria: String::new(),
        dependencies: dependencies.to_vec(),
    }
}

fn invoke(backend: &str, operation: &str, params: serde_json::Value) -> ToolInvocation {
    let mut invocation = ToolInvocation::new(backend, operation);
    if let serde_json::Value::Object(map) = params {
        for (key, value) in map {
            invocation = invocation.with_param(key, value);
        }
    }
    invocation
}

fn driver(
    config: &FlowConfig,
    root: &std::path::Path,
    reasoner: Arc<ScriptedReasoner>,
    approvals: Arc<dyn ApprovalGate>,
) -> WorkflowDriver {
    let services =
        WorkflowServices::from_config(config, default_registry(root), reasoner, approvals);
    WorkflowDriver::new(Arc::new(services))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dependent_items_share_the_file_system() {
    let dir = tempfile::tempdir().unwrap();
    let reasoner = Arc::new(
        ScriptedReasoner::default()
            .plan(
                "write",
                vec![invoke(
                    "fs",
                    "write_file",
                    json!({ "path": "out/hello.txt", "content": "hello" }),
                )],
            )
            .plan(
                "read",
                vec![invoke("fs", "read_file", json!({ "path": "out/hello.txt" }))],
            ),
    );
    let driver = driver(&fast_config(), dir.path(), reasoner, Arc::new(AllowAll));

    let report = driver
        .run(vec![item(1, "write", "fs", &[]), item(2, "read", "fs", &[1])])
        .await
        .unwrap();

    assert!(report.all_succeeded(), "{report:#?}");
    let read = report.get(2).unwrap();
    let execution = read
        .evidence
        .iter()
        .find(|e| e.kind == EvidenceKind::Execution)
        .unwrap();
    assert_eq!(execution.detail[0]["outcome"]["payload"]["content"], "hello");
}

#[tokio::test]
async fn repeated_invocations_are_denied_and_the_item_is_replanned() {
    let dir = tempfile::tempdir().unwrap();
    let same = invoke("memory", "set", json!({ "key": "k", "value": 1 }));
    let reasoner = Arc::new(
        ScriptedReasoner::default()
            .plan("stuck", vec![same.clone(), same.clone(), same.clone(), same])
            .plan(
                "unstuck",
                vec![invoke("memory", "set", json!({ "key": "k", "value": 2 }))],
            )
            .replan_to(ReplannedItem {
                action: "unstuck".into(),
                parameters: Default::default(),
                success_criteria: None,
                allowed_backends: None,
            }),
    );
    let driver = driver(&fast_config(), dir.path(), reasoner, Arc::new(AllowAll));

    let report = driver.run(vec![item(1, "stuck", "memory", &[])]).await.unwrap();

    let stuck = report.get(1).unwrap();
    assert_eq!(stuck.status, ItemStatus::Succeeded);
    assert_eq!(stuck.lineage.len(), 2);
    assert_eq!(stuck.action, "unstuck");

    let denials = driver
        .services()
        .guard()
        .log()
        .iter()
        .filter(|entry| entry.finding.kind == FindingKind::Deny)
        .count();
    assert_eq!(denials, 13);
}

#[tokio::test]
async fn approval_gate_decides_guarded_invocations() {
    let mut config = fast_config();
    config.guard.cumulative_ceiling = 2;
    let plan = vec![
        invoke("memory", "set", json!({ "key": "a", "value": 1 })),
        invoke("memory", "set", json!({ "key": "b", "value": 1 })),
        invoke("memory", "set", json!({ "key": "c", "value": 1 })),
    ];

    let dir = tempfile::tempdir().unwrap();
    let approved = driver(
        &config,
        dir.path(),
        Arc::new(ScriptedReasoner::default().plan("fill", plan.clone())),
        Arc::new(AllowAll),
    )
    .run(vec![item(1, "fill", "memory", &[])])
    .await
    .unwrap();
    assert_eq!(approved.get(1).unwrap().status, ItemStatus::Succeeded);

    let refused = driver(
        &config,
        dir.path(),
        Arc::new(ScriptedReasoner::default().plan("fill", plan)),
        Arc::new(DenyAll),
    )
    .run(vec![item(1, "fill", "memory", &[]), item(2, "after", "memory", &[1])])
    .await
    .unwrap();
    let fill = refused.get(1).unwrap();
    assert_eq!(fill.status, ItemStatus::Skipped);
    assert!(
        fill.evidence
            .iter()
            .all(|e| e.kind != EvidenceKind::Verification)
    );
    assert!(fill.evidence.iter().any(|e| e.kind == EvidenceKind::Guard));
    assert_eq!(refused.get(2).unwrap().status, ItemStatus::Skipped);
}

#[tokio::test]
async fn identical_planning_requests_are_batched() {
    let dir = tempfile::tempdir().unwrap();
    let reasoner = Arc::new(ScriptedReasoner::default());
    let driver = driver(
        &fast_config(),
        dir.path(),
        Arc::clone(&reasoner),
        Arc::new(AllowAll),
    );

    let report = driver
        .run(vec![
            item(1, "summarize", "memory", &[]),
            item(2, "summarize", "memory", &[]),
            item(3, "other", "memory", &[]),
        ])
        .await
        .unwrap();

    assert!(report.all_succeeded());
    assert_eq!(reasoner.plan_calls(), 2);
    assert_eq!(driver.services().admission.stats().deduplicated, 1);
}

#[tokio::test]
async fn sandbox_escape_fails_the_item_without_touching_the_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let reasoner = Arc::new(ScriptedReasoner::default().plan(
        "escape",
        vec![invoke(
            "fs",
            "write_file",
            json!({ "path": "../outside.txt", "content": "x" }),
        )],
    ));
    let driver = driver(&fast_config(), &root, reasoner, Arc::new(AllowAll));

    let report = driver.run(vec![item(1, "escape", "fs", &[])]).await.unwrap();

    assert_eq!(report.get(1).unwrap().status, ItemStatus::Skipped);
    assert!(!dir.path().join("outside.txt").exists());
}
