//! Capability registry: the process-wide table of executable capabilities.
//!
//! Built exactly once at startup from an explicit provider manifest, then
//! read-only — lookups need no locking and registration order is visible in
//! the manifest instead of hidden in import side effects. Providers
//! contribute three kinds of capability:
//!
//! - step handlers (named activities invoked by the orchestrator),
//! - workflow definitions (startable by name via RPC or a schedule),
//! - sub-agent kinds (command descriptors for sandboxed code execution).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::models::definition::WorkflowDefinition;
use crate::models::run::RunStatusView;

/// Step-level failure, classified by the handler's own error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Worth retrying per the step's policy (network hiccup, contention).
    #[error("transient: {0}")]
    Transient(String),
    /// The input is unprocessable; the run fails without further attempts.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

/// Everything a handler may touch during one attempt.
pub struct StepContext {
    pub run_id: String,
    pub tenant_id: String,
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The run's start payload, passed through opaquely.
    pub input: serde_json::Value,
    /// Handler parameters from the step specification.
    pub params: serde_json::Value,
    /// Outputs of previously completed steps, by step name.
    pub prior_outputs: HashMap<String, serde_json::Value>,
    /// Observed by cooperative handlers; forced for sandbox executions.
    pub cancel: CancelToken,
    spawner: Arc<dyn RunSpawner>,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        tenant_id: String,
        step_name: String,
        attempt: u32,
        input: serde_json::Value,
        params: serde_json::Value,
        prior_outputs: HashMap<String, serde_json::Value>,
        cancel: CancelToken,
        spawner: Arc<dyn RunSpawner>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            step_name,
            attempt,
            input,
            params,
            prior_outputs,
            cancel,
            spawner,
        }
    }

    /// Durably record and start a child run. The calling step is complete
    /// as soon as this returns — awaiting the child is a separate,
    /// cooperative concern (see [`StepContext::run_status`]).
    pub async fn spawn_child(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<String, EngineError> {
        self.spawner
            .spawn_child(&self.run_id, &self.tenant_id, definition, input)
            .await
    }

    /// Status of another run, typically a child spawned by an earlier step.
    /// A step that needs to wait returns `StepError::Transient` while the
    /// child is non-terminal and lets its retry policy pace the polling.
    pub async fn run_status(&self, run_id: &str) -> Result<RunStatusView, EngineError> {
        self.spawner.run_status(run_id).await
    }
}

/// Orchestrator-side surface exposed to step handlers.
#[async_trait]
pub trait RunSpawner: Send + Sync {
    async fn spawn_child(
        &self,
        parent_run_id: &str,
        tenant_id: &str,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<String, EngineError>;

    async fn run_status(&self, run_id: &str) -> Result<RunStatusView, EngineError>;
}

/// One unit of work within a workflow. Handlers must be safe to retry:
/// the in-flight step at crash time is re-executed at least once.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> Result<serde_json::Value, StepError>;
}

/// Command descriptor for one sub-agent kind. `{file}` in the argument list
/// is replaced with the path of the task file inside the isolation scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentKind {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

/// A pluggable capability provider, listed in the startup manifest.
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Task queue the provider's workflows run on.
    fn task_queue(&self) -> &str {
        "default"
    }

    fn step_handlers(&self) -> Vec<(String, Arc<dyn StepHandler>)> {
        Vec::new()
    }

    fn workflows(&self) -> Vec<WorkflowDefinition> {
        Vec::new()
    }

    fn sub_agent_kinds(&self) -> Vec<SubAgentKind> {
        Vec::new()
    }
}

/// The assembled, read-only capability table.
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    workflows: HashMap<String, WorkflowDefinition>,
    kinds: HashMap<String, SubAgentKind>,
    queues: HashMap<String, String>,
}

impl CapabilityRegistry {
    /// Assemble the registry from the provider manifest. First registration
    /// of a name wins; later duplicates are skipped with a warning.
    pub fn from_providers(providers: Vec<Box<dyn CapabilityProvider>>) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            workflows: HashMap::new(),
            kinds: HashMap::new(),
            queues: HashMap::new(),
        };

        for kind in builtin_sub_agent_kinds() {
            registry.kinds.insert(kind.name.clone(), kind);
        }

        for provider in &providers {
            let queue = provider.task_queue().to_string();

            for (name, handler) in provider.step_handlers() {
                if registry.handlers.contains_key(&name) {
                    tracing::warn!(
                        "[Registry] Handler '{}' from provider '{}' already registered, skipping",
                        name,
                        provider.name()
                    );
                    continue;
                }
                registry.handlers.insert(name, handler);
            }

            for def in provider.workflows() {
                if registry.workflows.contains_key(&def.name) {
                    tracing::warn!(
                        "[Registry] Workflow '{}' from provider '{}' already registered, skipping",
                        def.name,
                        provider.name()
                    );
                    continue;
                }
                registry.queues.insert(def.name.clone(), queue.clone());
                registry.workflows.insert(def.name.clone(), def);
            }

            for kind in provider.sub_agent_kinds() {
                registry.kinds.entry(kind.name.clone()).or_insert(kind);
            }

            tracing::info!(
                "[Registry] Registered provider: {} (queue={})",
                provider.name(),
                queue
            );
        }

        registry
    }

    /// Register a handler outside the provider manifest. Used for engine
    /// built-ins (the sub-agent bridge) during state assembly, before the
    /// registry is shared.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name)
    }

    pub fn sub_agent_kind(&self, name: &str) -> Option<&SubAgentKind> {
        self.kinds.get(name)
    }

    pub fn sub_agent_kinds(&self) -> Vec<SubAgentKind> {
        self.kinds.values().cloned().collect()
    }

    pub fn task_queue(&self, workflow_name: &str) -> &str {
        self.queues
            .get(workflow_name)
            .map(|q| q.as_str())
            .unwrap_or("default")
    }

    /// Reject definitions that reference handlers the registry does not
    /// know, before any run state is created.
    pub fn check_definition(&self, def: &WorkflowDefinition) -> Result<(), EngineError> {
        for step in &def.steps {
            if !self.handlers.contains_key(&step.handler) {
                return Err(EngineError::BadRequest(format!(
                    "Step '{}' references unknown handler '{}'",
                    step.name, step.handler
                )));
            }
        }
        Ok(())
    }
}

/// Sub-agent kinds available without any provider.
fn builtin_sub_agent_kinds() -> Vec<SubAgentKind> {
    vec![
        SubAgentKind {
            name: "shell".to_string(),
            program: "/bin/sh".to_string(),
            args: vec!["{file}".to_string()],
        },
        SubAgentKind {
            name: "python".to_string(),
            program: "python3".to_string(),
            args: vec!["{file}".to_string()],
        },
    ]
}
