//! Workflow driver — runs items in dependency order.
//!
//! Items with satisfied dependencies are spawned into a `JoinSet`,
//! bounded by `max_parallel_items`. An item whose dependency ended in
//! anything other than `Succeeded` is skipped without ever leaving
//! `Pending`. One item aborting never stops independent items.

use crate::error::WorkflowError;
use crate::machine::{ItemOutcome, ItemStateMachine};
use crate::report::WorkflowReport;
use crate::services::WorkflowServices;
use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use taskpilot_core::{ItemId, ItemSpec, ItemStatus, WorkItem, WorkflowEvent};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct WorkflowDriver {
    services: Arc<WorkflowServices>,
}

impl WorkflowDriver {
    pub fn new(services: Arc<WorkflowServices>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<WorkflowServices> {
        &self.services
    }

    /// Check a workflow definition and build its pending items.
    pub fn validate(specs: &[ItemSpec]) -> Result<Vec<WorkItem>, WorkflowError> {
        let mut ids = HashSet::new();
        for spec in specs {
            if !ids.insert(spec.id) {
                return Err(WorkflowError::DuplicateItem(spec.id));
            }
        }

        for spec in specs {
            if let Some(dependency) = spec.dependencies.iter().find(|d| !ids.contains(*d)) {
                return Err(WorkflowError::UnknownDependency {
                    item: spec.id,
                    dependency: *dependency,
                });
            }
        }

        specs
            .iter()
            .cloned()
            .map(|spec| WorkItem::new(spec).map_err(WorkflowError::from))
            .collect()
    }

    /// Run every item to a terminal status.
    ///
    /// Only an invalid definition is an error; item failures are
    /// reported in the [`WorkflowReport`].
    pub async fn run(&self, specs: Vec<ItemSpec>) -> Result<WorkflowReport, WorkflowError> {
        let items = Self::validate(&specs)?;
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let first_free_id = items.iter().map(|i| i.id).max().unwrap_or(0) + 1;
        let machine = ItemStateMachine::new(
            Arc::clone(&self.services),
            run_id.as_str(),
            Arc::new(AtomicU64::new(first_free_id)),
        );

        info!(run_id = %run_id, items = items.len(), "Workflow started");
        self.services.events.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            items: items.len(),
            timestamp: started_at,
        });

        let mut pending: BTreeMap<ItemId, WorkItem> =
            items.into_iter().map(|item| (item.id, item)).collect();
        let mut finished: BTreeMap<ItemId, ItemOutcome> = BTreeMap::new();
        // Snapshots for items whose task dies without an outcome
        let mut in_flight: HashMap<ItemId, WorkItem> = HashMap::new();

        let semaphore = Arc::new(Semaphore::new(self.services.config.max_parallel_items.max(1)));
        let mut running: JoinSet<(ItemId, ItemOutcome)> = JoinSet::new();

        loop {
            self.skip_blocked(&mut pending, &mut finished);

            let ready: Vec<ItemId> = pending
                .values()
                .filter(|item| {
                    item.dependencies.iter().all(|dep| {
                        finished
                            .get(dep)
                            .is_some_and(|outcome| outcome.status().is_success())
                    })
                })
                .map(|item| item.id)
                .collect();

            for id in ready {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(item) = pending.remove(&id) else {
                    continue;
                };
                in_flight.insert(id, item.clone());

                let machine = machine.clone();
                let fallback = item.clone();
                running.spawn(async move {
                    let _permit = permit;
                    let outcome = match AssertUnwindSafe(machine.run(item)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            error!(item = id, "Item state machine panicked");
                            aborted(fallback, "state machine panicked")
                        }
                    };
                    (id, outcome)
                });
            }

            match running.join_next().await {
                Some(Ok((id, outcome))) => {
                    in_flight.remove(&id);
                    finished.insert(id, outcome);
                }
                Some(Err(e)) => warn!(error = %e, "Item task failed to complete"),
                None => {
                    for (id, item) in in_flight.drain() {
                        finished.insert(id, aborted(item, "item task lost"));
                    }
                    if pending.is_empty() {
                        break;
                    }
                    // Nothing running and nothing ready
                    for (id, item) in std::mem::take(&mut pending) {
                        warn!(item = id, "Item can never start, skipping");
                        finished.insert(id, self.skip(item, "dependencies never completed"));
                    }
                }
            }
        }

        let report = WorkflowReport {
            run_id: run_id.clone(),
            items: finished.into_values().map(Into::into).collect(),
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            run_id = %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            duration_ms = report.duration_ms(),
            "Workflow finished"
        );
        self.services.events.publish(WorkflowEvent::RunFinished {
            run_id,
            succeeded: report.succeeded(),
            failed: report.failed(),
            timestamp: report.finished_at,
        });

        Ok(report)
    }

    /// Skip pending items with a dependency that finished unsuccessfully.
    /// Ascending id order carries skips down dependency chains.
    fn skip_blocked(
        &self,
        pending: &mut BTreeMap<ItemId, WorkItem>,
        finished: &mut BTreeMap<ItemId, ItemOutcome>,
    ) {
        let ids: Vec<ItemId> = pending.keys().copied().collect();
        for id in ids {
            let blocker = pending.get(&id).and_then(|item| {
                item.dependencies.iter().find_map(|dep| {
                    finished
                        .get(dep)
                        .filter(|outcome| !outcome.status().is_success())
                        .map(|outcome| (*dep, outcome.status()))
                })
            });
            let Some((dep, status)) = blocker else {
                continue;
            };
            let Some(item) = pending.remove(&id) else {
                continue;
            };

            info!(item = id, dependency = dep, %status, "Dependency did not succeed, skipping item");
            let reason = format!("dependency {dep} ended {status}");
            finished.insert(id, self.skip(item, &reason));
        }
    }

    fn skip(&self, mut item: WorkItem, reason: &str) -> ItemOutcome {
        if item.transition(ItemStatus::Skipped).is_ok() {
            let now = Utc::now();
            self.services.events.publish(WorkflowEvent::StageEntered {
                item: item.id,
                status: ItemStatus::Skipped,
                attempt: item.attempt(),
                timestamp: now,
            });
            self.services.events.publish(WorkflowEvent::ItemFinished {
                item: item.id,
                status: ItemStatus::Skipped,
                timestamp: now,
            });
        }
        ItemOutcome {
            item,
            superseded: Vec::new(),
            replans: 0,
            error: Some(reason.to_string()),
        }
    }
}

fn aborted(mut item: WorkItem, reason: &str) -> ItemOutcome {
    // Terminal items cannot move; keep whatever they reached
    let _ = item.transition(ItemStatus::Aborted);
    ItemOutcome {
        item,
        superseded: Vec::new(),
        replans: 0,
        error: Some(reason.to_string()),
    }
}
