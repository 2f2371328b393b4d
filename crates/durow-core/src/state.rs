//! Engine state assembly: wires stores, registry, orchestrator, executor
//! and scheduler together over one database handle.

use std::sync::Arc;

use crate::audit::AuditRecorder;
use crate::cancel::{cancel_pair, CancelHandle};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::EngineError;
use crate::orchestrator::Orchestrator;
use crate::registry::{CapabilityProvider, CapabilityRegistry};
use crate::sandbox::{IsolationSpec, SubAgentExecutor, SubAgentStepHandler};
use crate::scheduler::ScheduleManager;
use crate::store::{AuditStore, RunStore, ScheduleStore};

pub struct EngineState {
    pub config: EngineConfig,
    pub db: Database,
    pub registry: Arc<CapabilityRegistry>,
    pub run_store: RunStore,
    pub schedule_store: ScheduleStore,
    pub audit_store: Arc<AuditStore>,
    pub audit: AuditRecorder,
    pub orchestrator: Orchestrator,
    pub executor: Arc<SubAgentExecutor>,
    pub scheduler: ScheduleManager,
}

pub type SharedState = Arc<EngineState>;

impl EngineState {
    /// Assemble the engine over an open database. The sub-agent bridge
    /// handler is registered before the registry is frozen, so workflows
    /// can reference it like any provider handler.
    pub fn build(
        config: EngineConfig,
        providers: Vec<Box<dyn CapabilityProvider>>,
        db: Database,
    ) -> Result<SharedState, EngineError> {
        let mut registry = CapabilityRegistry::from_providers(providers);

        let audit_store = Arc::new(AuditStore::new(db.clone()));
        let audit = AuditRecorder::new(audit_store.clone());

        let default_spec = IsolationSpec {
            wall_timeout_ms: config.default_step_timeout_ms,
            ..IsolationSpec::default()
        };
        let executor = Arc::new(SubAgentExecutor::new(
            registry.sub_agent_kinds(),
            config.max_concurrent_tasks,
            default_spec,
            audit.clone(),
        ));
        registry.register_handler(
            SubAgentStepHandler::NAME,
            Arc::new(SubAgentStepHandler::new(executor.clone())),
        );
        let registry = Arc::new(registry);

        let run_store = RunStore::new(db.clone());
        let orchestrator = Orchestrator::new(
            run_store.clone(),
            registry.clone(),
            audit.clone(),
            config.clone(),
        );
        let schedule_store = ScheduleStore::new(db.clone());
        let scheduler = ScheduleManager::new(schedule_store.clone(), orchestrator.clone());

        Ok(Arc::new(Self {
            config,
            db,
            registry,
            run_store,
            schedule_store,
            audit_store,
            audit,
            orchestrator,
            executor,
            scheduler,
        }))
    }

    /// Run the boot-time recovery pass and start the schedule timer loop.
    /// Returns the handle that stops the loop.
    pub async fn start_background(&self) -> Result<CancelHandle, EngineError> {
        let resumed = self.orchestrator.resume_incomplete().await?;
        tracing::info!("[Engine] Recovery pass resumed {} run(s)", resumed);

        let (handle, token) = cancel_pair();
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run_loop(token).await });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SubAgentStepHandler;

    #[tokio::test]
    async fn test_build_registers_exec_bridge() {
        let state = EngineState::build(
            EngineConfig::default(),
            vec![],
            Database::open_in_memory().unwrap(),
        )
        .unwrap();
        assert!(state.registry.handler(SubAgentStepHandler::NAME).is_some());
        assert!(state.registry.sub_agent_kind("shell").is_some());
    }

    #[tokio::test]
    async fn test_background_start_and_stop() {
        let state = EngineState::build(
            EngineConfig::default(),
            vec![],
            Database::open_in_memory().unwrap(),
        )
        .unwrap();
        let handle = state.start_background().await.unwrap();
        handle.cancel();
    }
}
