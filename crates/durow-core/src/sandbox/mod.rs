//! Sandboxed execution of sub-agent task code.

pub mod executor;
pub mod isolation;

pub use executor::{
    CodeTask, ExecTrace, SubAgentExecutor, SubAgentResult, SubAgentStatus, SubAgentStepHandler,
};
pub use isolation::{IsolationContext, IsolationManager, IsolationSpec};
