//! Durow core: a durable task-execution engine.
//!
//! Workflow runs are persistent state machines driven step by step, with
//! retries, per-run leases and optimistic concurrency; cron schedules fire
//! from a single timer loop; untrusted task code runs in sandboxed
//! subprocesses with resource ceilings; every execution request is
//! authorized by a capability token and traced in a deduplicated audit
//! trail.

pub mod audit;
pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod security;
pub mod state;
pub mod store;

pub use audit::AuditRecorder;
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::EngineConfig;
pub use db::Database;
pub use error::EngineError;
pub use models::audit::AuditRecord;
pub use models::definition::{RetryPolicy, StepSpec, WorkflowDefinition};
pub use models::run::{RunHandle, RunStatus, RunStatusView, StepRecord, WorkflowRun};
pub use models::schedule::{CreateScheduleInput, ScheduleEntry};
pub use orchestrator::Orchestrator;
pub use registry::{
    CapabilityProvider, CapabilityRegistry, RunSpawner, StepContext, StepError, StepHandler,
    SubAgentKind,
};
pub use sandbox::{
    CodeTask, ExecTrace, IsolationSpec, SubAgentExecutor, SubAgentResult, SubAgentStatus,
};
pub use scheduler::ScheduleManager;
pub use security::{authorize, scopes, CapabilityToken};
pub use state::{EngineState, SharedState};
