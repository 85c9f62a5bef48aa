//! `taskpilot run` — run a workflow file with a playbook reasoner.
//!
//! A workflow file lists items together with the tool plans they should
//! execute, so no reasoning service is needed:
//!
//! ```toml
//! [[items]]
//! id = 1
//! action = "write greeting"
//! allowed_backends = ["fs"]
//!
//! [[items.tools]]
//! backend = "fs"
//! operation = "write_file"
//! parameters = { path = "hello.txt", content = "hi" }
//!
//! [items.fallback]          # optional replacement after a failed replan
//! action = "store greeting"
//! allowed_backends = ["memory"]
//! tools = [{ backend = "memory", operation = "set", parameters = { key = "greeting", value = "hi" } }]
//! ```
//!
//! Verification passes when every invocation of the current attempt
//! completed.

use super::load_config;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskpilot_core::{
    AllowAll, ApprovalGate, ApprovalRequest, CollaboratorError, Evidence, EvidenceKind, ItemPlan,
    ItemSpec, ItemStatus, OperationSpec, ReplanDecision, ReplannedItem, Reasoner, ToolInvocation,
    ToolPlan, Verification, WorkItem, WorkflowEvent,
};
use taskpilot_tools::{InvocationRecord, default_registry};
use taskpilot_workflow::{WorkflowDriver, WorkflowReport, WorkflowServices};
use tracing::info;

pub struct RunArgs {
    pub workflow: PathBuf,
    pub root: PathBuf,
    pub auto_approve: bool,
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// A workflow definition with embedded tool plans.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub items: Vec<PlaybookItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybookItem {
    #[serde(flatten)]
    pub spec: ItemSpec,

    #[serde(default)]
    pub tools: Vec<ToolInvocation>,

    #[serde(default)]
    pub fallback: Option<Fallback>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fallback {
    #[serde(flatten)]
    pub item: ReplannedItem,

    #[serde(default)]
    pub tools: Vec<ToolInvocation>,
}

impl WorkflowFile {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub async fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        let file = Self::parse(&content).map_err(|e| format!("Invalid workflow file: {e}"))?;
        info!(workflow = %path.display(), items = file.items.len(), "Workflow file loaded");
        Ok(file)
    }

    pub fn specs(&self) -> Vec<ItemSpec> {
        self.items.iter().map(|i| i.spec.clone()).collect()
    }
}

/// Reasoner that answers from the plans embedded in a workflow file.
pub struct PlaybookReasoner {
    /// Tool plans by action
    plans: HashMap<String, Vec<ToolInvocation>>,
    /// Replacement definitions by the action they replace
    fallbacks: HashMap<String, ReplannedItem>,
}

impl PlaybookReasoner {
    pub fn new(file: &WorkflowFile) -> Self {
        let mut plans = HashMap::new();
        let mut fallbacks = HashMap::new();
        for item in &file.items {
            plans.insert(item.spec.action.clone(), item.tools.clone());
            if let Some(fallback) = &item.fallback {
                plans.insert(fallback.item.action.clone(), fallback.tools.clone());
                fallbacks.insert(item.spec.action.clone(), fallback.item.clone());
            }
        }
        Self { plans, fallbacks }
    }

    fn plan_for(&self, item: &WorkItem) -> Result<ToolPlan, CollaboratorError> {
        self.plans
            .get(&item.action)
            .map(|tools| ToolPlan::new(tools.clone()))
            .ok_or_else(|| CollaboratorError::Malformed(format!("no plan for '{}'", item.action)))
    }
}

#[async_trait]
impl Reasoner for PlaybookReasoner {
    fn name(&self) -> &str {
        "playbook"
    }

    async fn plan_item(&self, item: &WorkItem) -> Result<ItemPlan, CollaboratorError> {
        Ok(ItemPlan {
            summary: item.action.clone(),
            details: json!({ "criteria": item.success_criteria }),
        })
    }

    async fn plan_tools(
        &self,
        item: &WorkItem,
        _catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError> {
        self.plan_for(item)
    }

    async fn verify(
        &self,
        _item: &WorkItem,
        evidence: &[Evidence],
    ) -> Result<Verification, CollaboratorError> {
        let mut completed = 0;
        let mut failed = 0;
        for e in evidence.iter().filter(|e| e.kind == EvidenceKind::Execution) {
            let records: Vec<InvocationRecord> = serde_json::from_value(e.detail.clone())
                .map_err(|err| CollaboratorError::Malformed(err.to_string()))?;
            for record in &records {
                if record.is_completed() {
                    completed += 1;
                } else {
                    failed += 1;
                }
            }
        }

        let detail = json!({ "completed": completed, "failed": failed });
        Ok(if failed == 0 {
            Verification::passed(detail)
        } else {
            Verification::failed(detail)
        })
    }

    async fn adjust(
        &self,
        item: &WorkItem,
        _verification: &Verification,
        _catalogue: &[OperationSpec],
    ) -> Result<ToolPlan, CollaboratorError> {
        // A playbook has one plan per action; retry it as-is
        self.plan_for(item)
    }

    async fn replan(&self, item: &WorkItem) -> Result<ReplanDecision, CollaboratorError> {
        Ok(match self.fallbacks.get(&item.action) {
            Some(fallback) => ReplanDecision::NewPlan(fallback.clone()),
            None => ReplanDecision::NoViablePlan {
                reason: format!("no fallback for '{}'", item.action),
            },
        })
    }
}

/// Asks on the terminal before a guarded invocation runs.
pub struct PromptGate;

#[async_trait]
impl ApprovalGate for PromptGate {
    async fn confirm(&self, request: &ApprovalRequest) -> bool {
        let prompt = format!(
            "  ⚠️  {} ({}) — run anyway? [y/N] ",
            request.invocation, request.reason
        );
        tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            if std::io::stdout().flush().is_err() {
                return false;
            }
            let mut answer = String::new();
            match std::io::stdin().read_line(&mut answer) {
                Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
                Err(_) => false,
            }
        })
        .await
        .unwrap_or(false)
    }
}

pub async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())
        .map_err(|e| format!("Failed to load config: {e}"))?;
    let file = WorkflowFile::load(&args.workflow).await?;

    let approvals: Arc<dyn ApprovalGate> = if args.auto_approve {
        Arc::new(AllowAll)
    } else {
        Arc::new(PromptGate)
    };
    let services = WorkflowServices::from_config(
        &config,
        default_registry(&args.root),
        Arc::new(PlaybookReasoner::new(&file)),
        approvals,
    );
    let driver = WorkflowDriver::new(Arc::new(services));

    if !args.json {
        println!();
        println!("  🚀 Running {} ({} items)", args.workflow.display(), file.items.len());
        println!("     Back ends: fs (root {}), memory", args.root.display());
        println!();
    }

    let progress = (!args.json).then(|| {
        let mut events = driver.services().events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Some(line) = describe(&event) {
                    println!("{line}");
                }
            }
        })
    });

    let report = driver.run(file.specs()).await?;

    if let Some(progress) = progress {
        // Let the printer drain what was already published
        tokio::time::sleep(Duration::from_millis(20)).await;
        progress.abort();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if report.all_succeeded() {
        Ok(())
    } else {
        Err(format!("{} of {} items did not succeed", report.failed(), report.items.len()).into())
    }
}

fn describe(event: &WorkflowEvent) -> Option<String> {
    match event {
        WorkflowEvent::StageEntered { item, status, attempt, .. } => {
            Some(format!("     [item {item}] → {status} (attempt {attempt})"))
        }
        WorkflowEvent::FindingEmitted { item, backend, operation, kind, rule, .. } => Some(format!(
            "     [item {item}] guard {kind}: {backend}.{operation} ({rule})"
        )),
        WorkflowEvent::ItemReplanned { from, to, .. } => {
            Some(format!("     [item {from}] replanned as item {to}"))
        }
        _ => None,
    }
}

fn print_summary(report: &WorkflowReport) {
    println!();
    for item in &report.items {
        let mark = match item.status {
            ItemStatus::Succeeded => "✅",
            ItemStatus::Skipped => "⏭️ ",
            _ => "❌",
        };
        let lineage = if item.lineage.len() > 1 {
            format!(
                " via {}",
                item.lineage
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(" → ")
            )
        } else {
            String::new()
        };
        println!(
            "  {mark} #{:<3} {:<10} {}{} (adjustments {}, replans {})",
            item.id,
            item.status.to_string(),
            item.action,
            lineage,
            item.attempts,
            item.replans
        );
        if let Some(error) = &item.error {
            println!("          {error}");
        }
    }
    println!();
    println!(
        "  {} succeeded, {} failed in {}ms (run {})",
        report.succeeded(),
        report.failed(),
        report.duration_ms(),
        report.run_id
    );
    println!();
}
