use crate::machine::ItemOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use taskpilot_core::{Evidence, ItemId, ItemStatus};

/// Final state of one item lineage.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    /// Id from the workflow definition
    pub id: ItemId,
    /// Id of the last successor (equal to `id` when never replanned)
    pub final_id: ItemId,
    pub action: String,
    pub status: ItemStatus,
    /// Adjustments made by the final item
    pub attempts: u32,
    pub replans: u32,
    pub lineage: Vec<ItemId>,
    pub evidence: Vec<Evidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ItemOutcome> for ItemReport {
    fn from(outcome: ItemOutcome) -> Self {
        let lineage = outcome.lineage();
        let item = outcome.item;
        Self {
            id: item.origin,
            final_id: item.id,
            status: item.status(),
            attempts: item.attempt(),
            replans: outcome.replans,
            lineage,
            evidence: item.evidence().to_vec(),
            action: item.action,
            error: outcome.error,
        }
    }
}

/// Result of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub run_id: String,
    /// Ordered by definition id
    pub items: Vec<ItemReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowReport {
    pub fn get(&self, id: ItemId) -> Option<&ItemReport> {
        self.items.iter().find(|r| r.id == id)
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|r| r.status.is_success()).count()
    }

    /// Items that ended `Skipped` or `Aborted`.
    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spec;
    use serde_json::json;
    use taskpilot_core::{EvidenceKind, WorkItem};

    fn outcome(id: ItemId, status: ItemStatus) -> ItemOutcome {
        let mut item = WorkItem::new(spec(id, "act", &[])).unwrap();
        item.transition(ItemStatus::Planning).unwrap();
        item.record(EvidenceKind::Plan, json!({ "summary": "s" }));
        if status == ItemStatus::Aborted {
            item.transition(status).unwrap();
        }
        ItemOutcome {
            item,
            superseded: Vec::new(),
            replans: 0,
            error: (status == ItemStatus::Aborted).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn report_counts_and_lookup() {
        let report = WorkflowReport {
            run_id: "r".into(),
            items: vec![
                outcome(1, ItemStatus::Aborted).into(),
                outcome(2, ItemStatus::Planning).into(),
            ],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.failed(), 2);
        assert!(!report.all_succeeded());

        let first = report.get(1).unwrap();
        assert_eq!(first.lineage, vec![1]);
        assert_eq!(first.final_id, 1);
        assert_eq!(first.error.as_deref(), Some("boom"));
        assert_eq!(first.evidence.len(), 1);
        assert!(report.get(3).is_none());
    }

    #[test]
    fn item_report_serializes_without_empty_error() {
        let report = ItemReport::from(outcome(2, ItemStatus::Planning));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["id"], json!(2));
        assert!(value.get("error").is_none());
        assert_eq!(value["evidence"][0]["kind"], json!("plan"));
    }
}
