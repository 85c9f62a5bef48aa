//! Tool executor — guarded, bounded-parallel dispatch of tool plans.
//!
//! The whole list is shown to the loop guard before anything runs.
//! Denied invocations are skipped, approval-gated ones wait for the
//! injected [`ApprovalGate`], and the rest run concurrently with a
//! per-list limit and a global limit shared by every item.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use taskpilot_config::ExecutorConfig;
use taskpilot_core::{
    ApprovalGate, ApprovalRequest, BackendFailure, BackendRegistry, FailureReason, ToolInvocation,
};
use taskpilot_guard::{Finding, InspectionContext, LoopGuard, Verdict};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What happened to one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Completed {
        payload: serde_json::Value,
        attempts: u32,
        duration_ms: u64,
    },
    Failed {
        failure: BackendFailure,
        attempts: u32,
        duration_ms: u64,
    },
    /// Never dispatched: denied by the guard, or approval was not given.
    Vetoed { verdict: Verdict },
}

/// One invocation with its findings and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Position in the submitted list
    pub index: usize,
    pub invocation: ToolInvocation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    pub outcome: InvocationOutcome,
}

impl InvocationRecord {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Completed { .. })
    }

    pub fn is_vetoed(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Vetoed { .. })
    }
}

/// Result of executing one tool plan, in list order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub records: Vec<InvocationRecord>,
}

impl ExecutionReport {
    /// Whether the guard blocked at least one invocation.
    pub fn vetoed(&self) -> bool {
        self.records.iter().any(InvocationRecord::is_vetoed)
    }

    pub fn completed(&self) -> usize {
        self.records.iter().filter(|r| r.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, InvocationOutcome::Failed { .. }))
            .count()
    }

    pub fn all_completed(&self) -> bool {
        self.records.iter().all(InvocationRecord::is_completed)
    }

    pub fn findings(&self) -> impl Iterator<Item = (&InvocationRecord, &Finding)> {
        self.records
            .iter()
            .flat_map(|record| record.findings.iter().map(move |f| (record, f)))
    }
}

/// Dispatches tool plans to registered back ends.
pub struct ToolExecutor {
    registry: Arc<BackendRegistry>,
    guard: Arc<LoopGuard>,
    approvals: Arc<dyn ApprovalGate>,
    /// Shared by every list executed through this executor
    global: Arc<Semaphore>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        guard: Arc<LoopGuard>,
        approvals: Arc<dyn ApprovalGate>,
        config: ExecutorConfig,
    ) -> Self {
        let global = Arc::new(Semaphore::new(config.global_parallelism.max(1)));
        Self {
            registry,
            guard,
            approvals,
            global,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &Arc<LoopGuard> {
        &self.guard
    }

    /// Execute a list of invocations. Individual failures are recorded,
    /// never raised.
    pub async fn execute(
        &self,
        invocations: &[ToolInvocation],
        ctx: &InspectionContext,
    ) -> ExecutionReport {
        let inspected = self.guard.inspect(invocations, ctx);

        let mut records = Vec::with_capacity(invocations.len());
        let mut allowed = Vec::new();

        for (index, (invocation, findings)) in invocations.iter().zip(inspected).enumerate() {
            let verdict = Verdict::from_findings(&findings);
            let dispatch = match verdict {
                Verdict::Allow => true,
                Verdict::Deny => false,
                Verdict::RequireApproval => self.approve(invocation, &findings, ctx).await,
            };

            if dispatch {
                allowed.push((index, findings));
                continue;
            }
            info!(
                session = %ctx.session,
                item = ?ctx.item,
                invocation = %invocation,
                ?verdict,
                "Invocation vetoed"
            );
            records.push(InvocationRecord {
                index,
                invocation: invocation.clone(),
                findings,
                outcome: InvocationOutcome::Vetoed { verdict },
            });
        }

        let parallelism = self.config.per_item_parallelism.max(1);
        let executed: Vec<InvocationRecord> = stream::iter(allowed)
            .map(|(index, findings)| async move {
                let invocation = &invocations[index];
                InvocationRecord {
                    index,
                    invocation: invocation.clone(),
                    findings,
                    outcome: self.run(invocation).await,
                }
            })
            .buffered(parallelism)
            .collect()
            .await;

        records.extend(executed);
        records.sort_by_key(|record| record.index);

        let report = ExecutionReport { records };
        debug!(
            session = %ctx.session,
            item = ?ctx.item,
            total = report.records.len(),
            completed = report.completed(),
            failed = report.failed(),
            vetoed = report.vetoed(),
            "Tool plan executed"
        );
        report
    }

    async fn approve(
        &self,
        invocation: &ToolInvocation,
        findings: &[Finding],
        ctx: &InspectionContext,
    ) -> bool {
        let reason = findings
            .iter()
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let request = ApprovalRequest {
            item: ctx.item,
            invocation: invocation.clone(),
            reason,
        };

        match tokio::time::timeout(
            self.config.approval_timeout(),
            self.approvals.confirm(&request),
        )
        .await
        {
            Ok(approved) => {
                info!(invocation = %invocation, approved, "Approval answered");
                approved
            }
            Err(_) => {
                warn!(
                    invocation = %invocation,
                    timeout_ms = self.config.approval_timeout_ms,
                    "No approval received, treating as denied"
                );
                false
            }
        }
    }

    /// Run one allowed invocation, retrying transient failures of
    /// side-effect-free operations.
    async fn run(&self, invocation: &ToolInvocation) -> InvocationOutcome {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let Some(backend) = self.registry.get(&invocation.backend) else {
            warn!(backend = %invocation.backend, "Unknown back end");
            return InvocationOutcome::Failed {
                failure: BackendFailure::new(
                    FailureReason::UnknownBackend,
                    format!("no back end named '{}'", invocation.backend),
                ),
                attempts: 0,
                duration_ms: elapsed(),
            };
        };

        let side_effect_free = self
            .registry
            .operation(&invocation.backend, &invocation.operation)
            .is_some_and(|op| op.side_effect_free);
        let max_attempts = if side_effect_free {
            1 + self.config.side_effect_free_retries
        } else {
            1
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match Arc::clone(&self.global).acquire_owned().await {
                Ok(_permit) => {
                    match tokio::time::timeout(
                        self.config.invocation_timeout(),
                        backend.invoke(&invocation.operation, &invocation.parameters),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(BackendFailure::new(
                            FailureReason::Timeout,
                            format!(
                                "no response within {}ms",
                                self.config.invocation_timeout_ms
                            ),
                        )),
                    }
                }
                Err(_) => Err(BackendFailure::new(
                    FailureReason::Unavailable,
                    "executor is shutting down",
                )),
            };

            match result {
                Ok(payload) => {
                    debug!(invocation = %invocation, attempts, "Invocation completed");
                    return InvocationOutcome::Completed {
                        payload,
                        attempts,
                        duration_ms: elapsed(),
                    };
                }
                Err(failure) if failure.reason.is_transient() && attempts < max_attempts => {
                    debug!(invocation = %invocation, attempts, %failure, "Retrying invocation");
                }
                Err(failure) => {
                    warn!(invocation = %invocation, attempts, %failure, "Invocation failed");
                    return InvocationOutcome::Failed {
                        failure,
                        attempts,
                        duration_ms: elapsed(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use taskpilot_config::GuardConfig;
    use taskpilot_core::{AllowAll, Backend, DenyAll, OperationSpec, Parameters};
    use taskpilot_guard::FindingKind;

    /// `probe` fails transiently `flaky` times; `poke` is not side-effect free.
    struct FlakyBackend {
        flaky: u32,
        calls: AtomicU32,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(flaky: u32) -> Self {
            Self {
                flaky,
                calls: AtomicU32::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            "svc"
        }

        fn operations(&self) -> Vec<OperationSpec> {
            vec![
                OperationSpec::new("svc", "probe").read_only(),
                OperationSpec::new("svc", "poke"),
                OperationSpec::new("svc", "slow").read_only(),
            ]
        }

        async fn invoke(
            &self,
            operation: &str,
            parameters: &Parameters,
        ) -> Result<serde_json::Value, BackendFailure> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            let result = match operation {
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({ "n": parameters.get("n") }))
                }
                _ if call < self.flaky => Err(BackendFailure::new(
                    FailureReason::Unavailable,
                    "try again",
                )),
                "probe" | "poke" => Ok(json!({ "call": call })),
                other => Err(BackendFailure::unknown_operation("svc", other)),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct SilentGate;

    #[async_trait]
    impl ApprovalGate for SilentGate {
        async fn confirm(&self, _request: &ApprovalRequest) -> bool {
            std::future::pending().await
        }
    }

    fn executor_with(
        backend: Arc<FlakyBackend>,
        guard: GuardConfig,
        approvals: Arc<dyn ApprovalGate>,
        config: ExecutorConfig,
    ) -> ToolExecutor {
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        ToolExecutor::new(
            Arc::new(registry),
            Arc::new(LoopGuard::new(guard)),
            approvals,
            config,
        )
    }

    fn executor(backend: Arc<FlakyBackend>) -> ToolExecutor {
        executor_with(
            backend,
            GuardConfig::default(),
            Arc::new(DenyAll),
            ExecutorConfig::default(),
        )
    }

    fn probe(n: i64) -> ToolInvocation {
        ToolInvocation::new("svc", "probe").with_param("n", json!(n))
    }

    fn ctx() -> InspectionContext {
        InspectionContext::for_item("run/item-1", 1)
    }

    #[tokio::test]
    async fn executes_in_list_order() {
        let exec = executor(Arc::new(FlakyBackend::new(0)));
        let report = exec.execute(&[probe(1), probe(2), probe(3)], &ctx()).await;

        assert_eq!(report.records.len(), 3);
        assert!(report.all_completed());
        assert!(!report.vetoed());
        let indices: Vec<usize> = report.records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(report.records[2].invocation, probe(3));
    }

    #[tokio::test]
    async fn denied_invocation_is_skipped_and_others_run() {
        let backend = Arc::new(FlakyBackend::new(0));
        let exec = executor(backend.clone());
        let calls = vec![probe(1), probe(1), probe(1), probe(1), probe(2)];

        let report = exec.execute(&calls, &ctx()).await;

        assert!(report.vetoed());
        assert_eq!(
            report.records[3].outcome,
            InvocationOutcome::Vetoed {
                verdict: Verdict::Deny
            }
        );
        assert_eq!(report.records[3].findings[0].kind, FindingKind::Deny);
        assert_eq!(report.completed(), 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn approval_gate_decides_flagged_invocations() {
        let guard = GuardConfig {
            cumulative_ceiling: 1,
            ..GuardConfig::default()
        };

        let denied = executor_with(
            Arc::new(FlakyBackend::new(0)),
            guard.clone(),
            Arc::new(DenyAll),
            ExecutorConfig::default(),
        );
        let report = denied.execute(&[probe(1), probe(2)], &ctx()).await;
        assert!(report.records[0].is_completed());
        assert_eq!(
            report.records[1].outcome,
            InvocationOutcome::Vetoed {
                verdict: Verdict::RequireApproval
            }
        );

        let approved = executor_with(
            Arc::new(FlakyBackend::new(0)),
            guard,
            Arc::new(AllowAll),
            ExecutorConfig::default(),
        );
        let report = approved.execute(&[probe(1), probe(2)], &ctx()).await;
        assert!(report.all_completed());
        assert_eq!(
            report.records[1].findings[0].kind,
            FindingKind::RequireApproval
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_counts_as_denial() {
        let exec = executor_with(
            Arc::new(FlakyBackend::new(0)),
            GuardConfig {
                cumulative_ceiling: 1,
                ..GuardConfig::default()
            },
            Arc::new(SilentGate),
            ExecutorConfig::default(),
        );
        let report = exec.execute(&[probe(1), probe(2)], &ctx()).await;
        assert!(report.vetoed());
        assert!(report.records[1].is_vetoed());
    }

    #[tokio::test]
    async fn side_effect_free_operation_is_retried() {
        let backend = Arc::new(FlakyBackend::new(1));
        let exec = executor(backend.clone());

        let report = exec.execute(&[probe(1)], &ctx()).await;
        match &report.records[0].outcome {
            InvocationOutcome::Completed { attempts, .. } => assert_eq!(*attempts, 2),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn side_effecting_operation_is_not_retried() {
        let backend = Arc::new(FlakyBackend::new(1));
        let exec = executor(backend.clone());

        let report = exec
            .execute(&[ToolInvocation::new("svc", "poke")], &ctx())
            .await;
        match &report.records[0].outcome {
            InvocationOutcome::Failed {
                failure, attempts, ..
            } => {
                assert_eq!(failure.reason, FailureReason::Unavailable);
                assert_eq!(*attempts, 1);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_backend_is_a_failed_record() {
        let exec = executor(Arc::new(FlakyBackend::new(0)));
        let report = exec
            .execute(&[ToolInvocation::new("browser", "open")], &ctx())
            .await;
        match &report.records[0].outcome {
            InvocationOutcome::Failed { failure, .. } => {
                assert_eq!(failure.reason, FailureReason::UnknownBackend)
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parallelism_is_bounded_per_list() {
        let backend = Arc::new(FlakyBackend::new(0));
        let exec = executor(backend.clone());
        let calls: Vec<ToolInvocation> = (0..7)
            .map(|n| ToolInvocation::new("svc", "slow").with_param("n", json!(n)))
            .collect();

        let report = exec.execute(&calls, &ctx()).await;

        assert!(report.all_completed());
        assert_eq!(backend.peak.load(Ordering::SeqCst), 3);
        assert_eq!(report.records[6].invocation.parameters["n"], json!(6));
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_applies_across_lists() {
        let backend = Arc::new(FlakyBackend::new(0));
        let exec = Arc::new(executor_with(
            backend.clone(),
            GuardConfig::default(),
            Arc::new(DenyAll),
            ExecutorConfig {
                global_parallelism: 2,
                ..ExecutorConfig::default()
            },
        ));
        let calls: Vec<ToolInvocation> = (0..3)
            .map(|n| ToolInvocation::new("svc", "slow").with_param("n", json!(n)))
            .collect();

        let a = {
            let exec = exec.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                exec.execute(&calls, &InspectionContext::new("a")).await
            })
        };
        let b = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.execute(&calls, &InspectionContext::new("b")).await
            })
        };

        assert!(a.await.unwrap().all_completed());
        assert!(b.await.unwrap().all_completed());
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_invocation_times_out() {
        let exec = executor_with(
            Arc::new(FlakyBackend::new(0)),
            GuardConfig::default(),
            Arc::new(DenyAll),
            ExecutorConfig {
                invocation_timeout_ms: 10,
                side_effect_free_retries: 0,
                ..ExecutorConfig::default()
            },
        );
        let report = exec
            .execute(&[ToolInvocation::new("svc", "slow")], &ctx())
            .await;
        match &report.records[0].outcome {
            InvocationOutcome::Failed { failure, .. } => {
                assert_eq!(failure.reason, FailureReason::Timeout)
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn report_serializes_outcome_tag() {
        let record = InvocationRecord {
            index: 0,
            invocation: probe(1),
            findings: Vec::new(),
            outcome: InvocationOutcome::Vetoed {
                verdict: Verdict::Deny,
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"]["outcome"], "vetoed");
        assert_eq!(value["outcome"]["verdict"], "deny");
        assert!(value.get("findings").is_none());
    }
}
