//! `taskpilot guard` — dry-run an invocation list through the loop guard.

use super::load_config;
use std::path::Path;
use taskpilot_core::ToolInvocation;
use taskpilot_guard::{Finding, InspectionContext, LoopGuard, Verdict};

pub async fn run(invocations: &Path, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config).map_err(|e| format!("Failed to load config: {e}"))?;
    let content = tokio::fs::read_to_string(invocations)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", invocations.display()))?;
    let invocations: Vec<ToolInvocation> = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid invocation list: {e}"))?;

    let guard = LoopGuard::new(config.guard);
    let verdicts = inspect(&guard, &invocations);

    println!();
    for (index, (invocation, verdict, findings)) in verdicts.iter().enumerate() {
        let mark = match verdict {
            Verdict::Allow => "✅",
            Verdict::RequireApproval => "⚠️ ",
            Verdict::Deny => "⛔",
        };
        println!("  {mark} #{index:<3} {}  {}", invocation, invocation.canonical_key());
        for finding in findings {
            println!(
                "         {} ({}, confidence {:.2}): {}",
                finding.kind, finding.rule, finding.confidence, finding.message
            );
        }
    }

    let denied = verdicts.iter().filter(|(_, v, _)| *v == Verdict::Deny).count();
    let gated = verdicts
        .iter()
        .filter(|(_, v, _)| *v == Verdict::RequireApproval)
        .count();
    println!();
    println!(
        "  {} invocations: {} allowed, {} need approval, {} denied",
        verdicts.len(),
        verdicts.len() - denied - gated,
        gated,
        denied
    );
    println!();
    Ok(())
}

fn inspect<'a>(
    guard: &LoopGuard,
    invocations: &'a [ToolInvocation],
) -> Vec<(&'a ToolInvocation, Verdict, Vec<Finding>)> {
    let ctx = InspectionContext::new("cli");
    guard
        .inspect(invocations, &ctx)
        .into_iter()
        .zip(invocations)
        .map(|(findings, invocation)| (invocation, Verdict::from_findings(&findings), findings))
        .collect()
}
