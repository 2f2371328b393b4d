//! Workflow run state: one durable, resumable instance of a definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::definition::WorkflowDefinition;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RunStatus::Pending),
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal runs are retained for query but never re-entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Durable record of one completed (or terminally failed) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_index: u32,
    pub name: String,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Mutable workflow instance. Owned exclusively by its driver while leased;
/// concurrent writers are arbitrated by the `version` epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_name: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub definition: WorkflowDefinition,
    pub status: RunStatus,
    pub current_step: u32,
    pub steps: Vec<StepRecord>,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Optimistic-concurrency epoch, bumped on every persisted transition.
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        definition: WorkflowDefinition,
        input: serde_json::Value,
        tenant_id: String,
        dedupe_key: Option<String>,
        parent_run_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_name: definition.name.clone(),
            tenant_id,
            dedupe_key,
            definition,
            status: RunStatus::Pending,
            current_step: 0,
            steps: Vec::new(),
            input,
            result: None,
            last_error: None,
            parent_run_id,
            version: 1,
            lease_owner: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Handle returned by a start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    pub run_id: String,
    pub status: RunStatus,
    /// True when the start collided with an active run for the same dedupe
    /// key and this handle refers to that existing run.
    #[serde(default)]
    pub already_active: bool,
}

/// Point-in-time view answered by a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub current_step: u32,
    pub step_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl RunStatusView {
    pub fn from_run(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id.clone(),
            workflow_name: run.workflow_name.clone(),
            status: run.status,
            current_step: run.current_step,
            step_count: run.definition.steps.len() as u32,
            last_error: run.last_error.clone(),
            result: run.result.clone(),
        }
    }
}
