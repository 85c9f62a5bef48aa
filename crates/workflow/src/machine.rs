//! Item state machine.
//!
//! Drives one work item through its stages:
//!
//! ```text
//! Pending → Planning → Selecting → ToolPlanning → Executing → Verifying → Succeeded
//!                                      ▲              │            │
//!                                      └── Adjusting ◀┴────────────┤ (attempts left)
//!                                                                  ▼
//!                 Planning (successor) ◀──────────────────── Replanning → Skipped
//! ```
//!
//! Every reasoning call goes through the admission controller; every
//! execution goes through the tool executor and therefore the loop
//! guard. Any unrecoverable error moves the item to `Aborted`.

use crate::error::StageError;
use crate::services::WorkflowServices;
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use taskpilot_admission::SubmitOptions;
use taskpilot_core::{
    CollaboratorError, Evidence, EvidenceKind, ItemError, ItemId, ItemStatus, OperationSpec,
    ReplanDecision, ToolPlan, Verification, WorkItem, WorkflowEvent,
};
use taskpilot_guard::{Finding, InspectionContext};
use taskpilot_tools::InvocationOutcome;
use tracing::{debug, info, warn};

/// What an item and its replanned successors ended up as.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    /// The last item of the lineage
    pub item: WorkItem,
    /// Items retired by replanning, oldest first
    pub superseded: Vec<WorkItem>,
    pub replans: u32,
    /// Why the item was aborted
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn status(&self) -> ItemStatus {
        self.item.status()
    }

    pub fn origin(&self) -> ItemId {
        self.item.origin
    }

    /// Ids of every item in the lineage, oldest first.
    pub fn lineage(&self) -> Vec<ItemId> {
        self.superseded
            .iter()
            .map(|i| i.id)
            .chain(std::iter::once(self.item.id))
            .collect()
    }
}

enum Step {
    Stage(ItemStatus),
    Successor(WorkItem),
}

/// Per-plan working state. Reset when the item is replanned.
#[derive(Default)]
struct Scratch {
    catalogue: Arc<Vec<OperationSpec>>,
    /// Produced by the adjuster, consumed by the next tool-planning stage
    adjusted: Option<ToolPlan>,
    /// Accepted plan waiting for execution
    planned: Option<ToolPlan>,
    last_failure: Option<Verification>,
}

/// Runs items to a terminal status. Cheap to clone; one per spawned item.
#[derive(Clone)]
pub struct ItemStateMachine {
    services: Arc<WorkflowServices>,
    run_id: Arc<str>,
    /// Source of fresh ids for replanned successors
    next_id: Arc<AtomicU64>,
}

impl ItemStateMachine {
    pub fn new(
        services: Arc<WorkflowServices>,
        run_id: impl Into<Arc<str>>,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            services,
            run_id: run_id.into(),
            next_id,
        }
    }

    /// Drive `item` (and any successors) until a terminal status.
    pub async fn run(&self, mut item: WorkItem) -> ItemOutcome {
        // Guard state follows the lineage, so loops survive a replan
        let session = format!("{}/item-{}", self.run_id, item.origin);
        let mut superseded = Vec::new();
        let mut replans = 0;
        let mut error = None;
        let mut scratch = Scratch::default();

        if item.status() == ItemStatus::Pending
            && let Err(e) = self.enter(&mut item, ItemStatus::Planning)
        {
            error = Some(e.to_string());
            self.abort(&mut item);
        }

        while !item.status().is_terminal() {
            let step = match item.status() {
                ItemStatus::Planning => self.plan(&mut item).await.map(Step::Stage),
                ItemStatus::Selecting => self.select(&item, &mut scratch).map(Step::Stage),
                ItemStatus::ToolPlanning => {
                    self.plan_tools(&mut item, &mut scratch).await.map(Step::Stage)
                }
                ItemStatus::Executing => Ok(Step::Stage(
                    self.execute(&mut item, &mut scratch, &session).await,
                )),
                ItemStatus::Verifying => self.verify(&mut item, &mut scratch).await.map(Step::Stage),
                ItemStatus::Adjusting => self.adjust(&mut item, &mut scratch).await.map(Step::Stage),
                ItemStatus::Replanning => self.replan(&mut item, replans).await,
                ItemStatus::Pending
                | ItemStatus::Succeeded
                | ItemStatus::Skipped
                | ItemStatus::Aborted => break,
            };

            let result = match step {
                Ok(Step::Stage(next)) => self.enter(&mut item, next).map_err(StageError::from),
                Ok(Step::Successor(successor)) => {
                    replans += 1;
                    info!(
                        from = item.id,
                        to = successor.id,
                        origin = item.origin,
                        replans,
                        "Item replanned"
                    );
                    self.publish(WorkflowEvent::ItemReplanned {
                        from: item.id,
                        to: successor.id,
                        timestamp: Utc::now(),
                    });
                    superseded.push(std::mem::replace(&mut item, successor));
                    scratch = Scratch::default();
                    self.announce(&item);
                    Ok(())
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(item = item.id, stage = %item.status(), error = %e, "Item aborted");
                error = Some(e.to_string());
                self.abort(&mut item);
            }
        }

        info!(
            item = item.id,
            origin = item.origin,
            status = %item.status(),
            attempt = item.attempt(),
            replans,
            "Item finished"
        );
        // Lineage finished, drop its repetition record
        self.services.guard().reset_session(&session);
        self.publish(WorkflowEvent::ItemFinished {
            item: item.id,
            status: item.status(),
            timestamp: Utc::now(),
        });

        ItemOutcome {
            item,
            superseded,
            replans,
            error,
        }
    }

    // --- Stages ---

    async fn plan(&self, item: &mut WorkItem) -> Result<ItemStatus, StageError> {
        let reasoner = Arc::clone(&self.services.reasoner);
        let snapshot = Arc::new(item.clone());
        let options = SubmitOptions::new()
            .with_priority(self.services.config.priorities.planning)
            .with_batch_key(plan_key(item));

        let plan = self
            .consult(item.id, "planning", options, move || {
                let reasoner = Arc::clone(&reasoner);
                let item = Arc::clone(&snapshot);
                async move { reasoner.plan_item(&item).await }
            })
            .await?;

        item.record(
            EvidenceKind::Plan,
            json!({ "stage": "item", "summary": plan.summary, "details": plan.details }),
        );
        item.plan = Some(plan);
        Ok(ItemStatus::Selecting)
    }

    fn select(&self, item: &WorkItem, scratch: &mut Scratch) -> Result<ItemStatus, StageError> {
        let catalogue = self
            .services
            .executor
            .registry()
            .catalogue_for(item.allowed_backends());
        if catalogue.is_empty() {
            return Err(StageError::EmptyCatalogue(
                item.allowed_backends().iter().cloned().collect(),
            ));
        }

        debug!(item = item.id, operations = catalogue.len(), "Catalogue selected");
        scratch.catalogue = Arc::new(catalogue);
        Ok(ItemStatus::ToolPlanning)
    }

    async fn plan_tools(
        &self,
        item: &mut WorkItem,
        scratch: &mut Scratch,
    ) -> Result<ItemStatus, StageError> {
        let plan = match scratch.adjusted.take() {
            Some(plan) => plan,
            None => {
                let reasoner = Arc::clone(&self.services.reasoner);
                let snapshot = Arc::new(item.clone());
                let catalogue = Arc::clone(&scratch.catalogue);
                let options =
                    SubmitOptions::new().with_priority(self.services.config.priorities.tool_planning);

                self.consult(item.id, "tool planning", options, move || {
                    let reasoner = Arc::clone(&reasoner);
                    let item = Arc::clone(&snapshot);
                    let catalogue = Arc::clone(&catalogue);
                    async move { reasoner.plan_tools(&item, &catalogue).await }
                })
                .await?
            }
        };

        item.record(
            EvidenceKind::Plan,
            json!({
                "stage": "tools",
                "invocations": plan.invocations,
                "needs_split": plan.needs_split,
            }),
        );

        // Never execute a truncated list
        if plan.exceeds(self.services.config.max_invocations) {
            warn!(
                item = item.id,
                invocations = plan.invocations.len(),
                needs_split = plan.needs_split,
                "Tool plan too large, escalating to replan"
            );
            return Ok(ItemStatus::Replanning);
        }

        if let Some(invocation) = plan.invocations.iter().find(|inv| {
            !scratch
                .catalogue
                .iter()
                .any(|op| op.backend == inv.backend && op.name == inv.operation)
        }) {
            return Err(StageError::UnselectedOperation {
                backend: invocation.backend.clone(),
                operation: invocation.operation.clone(),
            });
        }

        scratch.planned = Some(plan);
        Ok(ItemStatus::Executing)
    }

    async fn execute(&self, item: &mut WorkItem, scratch: &mut Scratch, session: &str) -> ItemStatus {
        let plan = scratch.planned.take().unwrap_or_default();
        let ctx = InspectionContext::for_item(session, item.id);
        let report = self.services.executor.execute(&plan.invocations, &ctx).await;

        for (_, finding) in report.findings() {
            self.publish(WorkflowEvent::FindingEmitted {
                item: item.id,
                backend: finding.backend.clone(),
                operation: finding.operation.clone(),
                kind: finding.kind.to_string(),
                rule: finding.rule.to_string(),
                timestamp: Utc::now(),
            });
        }
        for record in &report.records {
            let (success, duration_ms) = match &record.outcome {
                InvocationOutcome::Completed { duration_ms, .. } => (true, *duration_ms),
                InvocationOutcome::Failed { duration_ms, .. } => (false, *duration_ms),
                InvocationOutcome::Vetoed { .. } => continue,
            };
            self.publish(WorkflowEvent::InvocationCompleted {
                item: item.id,
                backend: record.invocation.backend.clone(),
                operation: record.invocation.operation.clone(),
                success,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        item.record(
            EvidenceKind::Execution,
            serde_json::to_value(&report.records).unwrap_or_default(),
        );

        let findings: Vec<&Finding> = report.findings().map(|(_, f)| f).collect();
        if !findings.is_empty() {
            item.record(
                EvidenceKind::Guard,
                json!({ "vetoed": report.vetoed(), "findings": findings }),
            );
        }

        if report.vetoed() {
            warn!(
                item = item.id,
                attempt = item.attempt(),
                "Loop guard vetoed the tool plan, skipping verification"
            );
            scratch.last_failure = Some(Verification::failed(
                json!({ "reason": "loop guard veto", "findings": findings }),
            ));
            return self.after_failure(item);
        }

        ItemStatus::Verifying
    }

    async fn verify(
        &self,
        item: &mut WorkItem,
        scratch: &mut Scratch,
    ) -> Result<ItemStatus, StageError> {
        let reasoner = Arc::clone(&self.services.reasoner);
        let snapshot = Arc::new(item.clone());
        let evidence: Arc<Vec<Evidence>> = Arc::new(item.current_evidence().cloned().collect());
        let options =
            SubmitOptions::new().with_priority(self.services.config.priorities.verification);

        let verification = self
            .consult(item.id, "verification", options, move || {
                let reasoner = Arc::clone(&reasoner);
                let item = Arc::clone(&snapshot);
                let evidence = Arc::clone(&evidence);
                async move { reasoner.verify(&item, &evidence).await }
            })
            .await?;

        item.record(
            EvidenceKind::Verification,
            json!({ "verified": verification.verified, "evidence": verification.evidence }),
        );

        if verification.verified {
            return Ok(ItemStatus::Succeeded);
        }
        scratch.last_failure = Some(verification);
        Ok(self.after_failure(item))
    }

    async fn adjust(
        &self,
        item: &mut WorkItem,
        scratch: &mut Scratch,
    ) -> Result<ItemStatus, StageError> {
        let attempt = item.begin_adjustment()?;
        info!(item = item.id, attempt, "Adjusting tool plan");
        self.publish(WorkflowEvent::AttemptIncremented {
            item: item.id,
            attempt,
            timestamp: Utc::now(),
        });

        let reasoner = Arc::clone(&self.services.reasoner);
        let snapshot = Arc::new(item.clone());
        let catalogue = Arc::clone(&scratch.catalogue);
        let failure = Arc::new(
            scratch
                .last_failure
                .take()
                .unwrap_or_else(|| Verification::failed(serde_json::Value::Null)),
        );
        let options =
            SubmitOptions::new().with_priority(self.services.config.priorities.adjustment);

        let plan = self
            .consult(item.id, "adjustment", options, move || {
                let reasoner = Arc::clone(&reasoner);
                let item = Arc::clone(&snapshot);
                let failure = Arc::clone(&failure);
                let catalogue = Arc::clone(&catalogue);
                async move { reasoner.adjust(&item, &failure, &catalogue).await }
            })
            .await?;

        scratch.adjusted = Some(plan);
        Ok(ItemStatus::ToolPlanning)
    }

    async fn replan(&self, item: &mut WorkItem, replans: u32) -> Result<Step, StageError> {
        if !self.services.escalation.allow_replan(item, replans) {
            info!(item = item.id, replans, "Replan not permitted, skipping item");
            item.record(
                EvidenceKind::Plan,
                json!({ "stage": "replan", "permitted": false, "replans": replans }),
            );
            return Ok(Step::Stage(ItemStatus::Skipped));
        }

        let reasoner = Arc::clone(&self.services.reasoner);
        let snapshot = Arc::new(item.clone());
        let options =
            SubmitOptions::new().with_priority(self.services.config.priorities.replanning);

        let decision = self
            .consult(item.id, "replanning", options, move || {
                let reasoner = Arc::clone(&reasoner);
                let item = Arc::clone(&snapshot);
                async move { reasoner.replan(&item).await }
            })
            .await?;

        match decision {
            ReplanDecision::NewPlan(replanned) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let successor = item.successor(id, replanned)?;
                Ok(Step::Successor(successor))
            }
            ReplanDecision::NoViablePlan { reason } => {
                info!(item = item.id, %reason, "No viable replan");
                item.record(
                    EvidenceKind::Plan,
                    json!({ "stage": "replan", "viable": false, "reason": reason }),
                );
                Ok(Step::Stage(ItemStatus::Skipped))
            }
        }
    }

    // --- Helpers ---

    /// Adjust while attempts remain, then replan. `attempt` counts the
    /// adjustments already made, so `max_attempts` adjustments run before
    /// the failure after the last one escalates.
    fn after_failure(&self, item: &WorkItem) -> ItemStatus {
        let attempt = item.attempt();
        if attempt < self.services.config.max_attempts {
            ItemStatus::Adjusting
        } else {
            info!(item = item.id, attempt, "Attempts exhausted, escalating to replan");
            ItemStatus::Replanning
        }
    }

    /// Submit a reasoning call through admission, resubmitting after
    /// `QueueFull`/`Timeout` with exponential backoff.
    async fn consult<T, F, Fut>(
        &self,
        item: ItemId,
        stage: &'static str,
        options: SubmitOptions,
        work: F,
    ) -> Result<T, StageError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
    {
        let config = &self.services.config;
        let mut backoff = config.call_backoff();
        let mut resubmits = 0;

        loop {
            match self
                .services
                .admission
                .submit(options.clone(), work.clone())
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_resubmittable() && resubmits < config.call_retries => {
                    resubmits += 1;
                    warn!(
                        item,
                        stage,
                        resubmit = resubmits,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Admission refused call, resubmitting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(source) => return Err(StageError::Collaborator { stage, source }),
            }
        }
    }

    fn enter(&self, item: &mut WorkItem, next: ItemStatus) -> Result<(), ItemError> {
        let from = item.status();
        item.transition(next)?;
        debug!(item = item.id, %from, to = %next, attempt = item.attempt(), "Stage transition");
        self.announce(item);
        Ok(())
    }

    fn abort(&self, item: &mut WorkItem) {
        if item.transition(ItemStatus::Aborted).is_ok() {
            self.announce(item);
        }
    }

    fn announce(&self, item: &WorkItem) {
        self.publish(WorkflowEvent::StageEntered {
            item: item.id,
            status: item.status(),
            attempt: item.attempt(),
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: WorkflowEvent) {
        self.services.events.publish(event);
    }
}

/// Identical planning requests share one reasoning call.
fn plan_key(item: &WorkItem) -> String {
    format!(
        "plan:{}:{}",
        item.action,
        serde_json::Value::Object(item.parameters.clone())
    )
}
