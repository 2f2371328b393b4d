//! Workflow definition schema.
//!
//! A definition is an immutable, ordered list of step specifications. It can
//! be registered in code by a capability provider or loaded from a YAML file:
//!
//! ```yaml
//! name: "vendor-import"
//! version: "1.0"
//! steps:
//!   - name: "fetch"
//!     handler: "harvest.fetch"
//!     timeoutMs: 300000
//!   - name: "parse"
//!     handler: "harvest.parse"
//!     retry:
//!       maxAttempts: 3
//!       baseDelayMs: 1000
//!       multiplier: 2.0
//!   - name: "stage"
//!     handler: "harvest.stage"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Retry policy for a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows `completed_attempts` failures:
    /// `base * multiplier^(completed_attempts - 1)`, capped at `max_delay_ms`.
    /// The first attempt runs immediately.
    pub fn delay_before_retry(&self, completed_attempts: u32) -> Duration {
        if completed_attempts == 0 {
            return Duration::ZERO;
        }
        let exp = (completed_attempts - 1) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Specification of one step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step name, unique within the definition.
    pub name: String,

    /// Capability name resolved through the registry (e.g. "harvest.fetch").
    pub handler: String,

    /// Retry override; the engine's configured default policy applies when
    /// omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Per-attempt wall-clock timeout. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Handler-specific parameters, passed through opaquely.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// Immutable description of an ordered step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let def: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::BadRequest(format!("Invalid workflow YAML: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::BadRequest(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Structural checks that do not need the registry.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::BadRequest(
                "Workflow name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(EngineError::BadRequest(format!(
                "Workflow '{}' has no steps",
                self.name
            )));
        }
        for step in &self.steps {
            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 {
                    return Err(EngineError::BadRequest(format!(
                        "Step '{}' has maxAttempts = 0",
                        step.name
                    )));
                }
            }
        }
        Ok(())
    }
}
