//! Cron-triggered schedule entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cron-triggered recurring workflow start, scoped to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub id: String,
    pub tenant_id: String,
    pub workflow_name: String,
    pub cron_expr: String,
    pub task_queue: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Two create requests describe the same schedule when the trigger and
    /// target match. Enabled state and fire history are not part of the
    /// definition.
    pub fn definition_matches(&self, input: &CreateScheduleInput) -> bool {
        self.workflow_name == input.workflow_name
            && self.cron_expr == input.cron_expr
            && self.task_queue == input.task_queue
    }
}

/// Input for creating a new schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleInput {
    pub id: String,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub workflow_name: String,
    pub cron_expr: String,
    #[serde(default = "default_queue")]
    pub task_queue: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}
