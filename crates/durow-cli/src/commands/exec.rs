//! `durow exec` — run code in the sandbox directly.

use durow_core::sandbox::{CodeTask, ExecTrace};
use durow_core::CancelToken;

use super::{init_state, print_json};

pub async fn run(
    db_path: &str,
    kind: &str,
    code: Option<String>,
    file: Option<String>,
    tenant: &str,
    timeout_ms: Option<u64>,
) -> Result<(), String> {
    let code = match (code, file) {
        (Some(code), None) => code,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read '{}': {}", path, e))?,
        (Some(_), Some(_)) => return Err("--code and --file are mutually exclusive".to_string()),
        (None, None) => return Err("One of --code or --file is required".to_string()),
    };

    let state = init_state(db_path)?;
    let mut spec = state.executor.default_spec();
    if let Some(ms) = timeout_ms {
        spec.wall_timeout_ms = ms;
    }

    let run_id = format!("exec-{}", uuid::Uuid::new_v4());
    let task = CodeTask {
        kind: kind.to_string(),
        code,
    };
    let trace = ExecTrace {
        run_id: run_id.clone(),
        tenant_id: tenant.to_string(),
        step_id: kind.to_string(),
        attempt: 1,
    };

    let result = state
        .executor
        .execute(&task, &spec, &CancelToken::never(), &trace)
        .await
        .map_err(|e| e.to_string())?;

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    print_json(&serde_json::json!({
        "runId": run_id,
        "status": result.status.as_str(),
        "exitCode": result.exit_code,
        "durationMs": result.duration_ms,
    }));

    match result.exit_code {
        Some(0) => Ok(()),
        _ => Err(result
            .error
            .unwrap_or_else(|| "Execution did not complete".to_string())),
    }
}
