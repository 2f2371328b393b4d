//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses the
//! durow-core domain logic through `EngineState`.

pub mod exec;
pub mod schedule;
pub mod server;
pub mod workflow;

use durow_core::{Database, EngineConfig, EngineState, SharedState};

/// Initialize a shared `EngineState` against the given SQLite database
/// path, with no extra capability providers.
pub fn init_state(db_path: &str) -> Result<SharedState, String> {
    let mut config = EngineConfig::from_env();
    config.db_path = db_path.to_string();

    let db = Database::open(db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;

    EngineState::build(config, vec![], db).map_err(|e| e.to_string())
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
