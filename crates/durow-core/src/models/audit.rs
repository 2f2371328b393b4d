//! Audit trail records: one per executed step attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable, deduplicated trace entry for one step attempt.
///
/// The sink deduplicates on (`run_id`, `step_id`, `attempt`), so writers may
/// safely retry. `detail` carries input/output metadata, not raw payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub run_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub outcome: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(run_id: &str, step_id: &str, attempt: u32, outcome: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            attempt,
            outcome: outcome.to_string(),
            detail: serde_json::json!({}),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}
