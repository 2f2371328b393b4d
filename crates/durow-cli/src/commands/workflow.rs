//! `durow workflow` — start and inspect workflow runs.

use std::time::Duration;

use durow_core::{RunStatusView, WorkflowDefinition};

use super::{init_state, print_json};

pub async fn run(
    db_path: &str,
    file: &str,
    input: &str,
    tenant: &str,
    dedupe_key: Option<String>,
    wait: bool,
) -> Result<(), String> {
    let definition = WorkflowDefinition::from_file(file).map_err(|e| e.to_string())?;
    let input: serde_json::Value =
        serde_json::from_str(input).map_err(|e| format!("Invalid --input JSON: {}", e))?;

    let state = init_state(db_path)?;
    let handle = state
        .orchestrator
        .start_workflow(definition, input, tenant, dedupe_key)
        .await
        .map_err(|e| e.to_string())?;

    if handle.already_active {
        println!("Joined already-active run {}", handle.run_id);
    } else {
        println!("Started run {}", handle.run_id);
    }

    if wait {
        let run = state
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(24 * 3600))
            .await
            .map_err(|e| e.to_string())?;
        println!(
            "Run {} finished: {} ({} step(s))",
            run.id,
            run.status.as_str(),
            run.steps.len()
        );
        print_json(&serde_json::to_value(RunStatusView::from_run(&run)).unwrap_or_default());
        if run.status != durow_core::RunStatus::Completed {
            return Err(run
                .last_error
                .unwrap_or_else(|| "Run did not complete".to_string()));
        }
    }
    Ok(())
}

pub async fn status(db_path: &str, run_id: &str) -> Result<(), String> {
    let state = init_state(db_path)?;
    let view = state
        .orchestrator
        .get_status(run_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::to_value(view).unwrap_or_default());
    Ok(())
}

pub async fn cancel(db_path: &str, run_id: &str) -> Result<(), String> {
    let state = init_state(db_path)?;
    state
        .orchestrator
        .cancel(run_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("Cancellation requested for run {}", run_id);
    Ok(())
}

pub async fn audit(db_path: &str, run_id: &str) -> Result<(), String> {
    let state = init_state(db_path)?;
    let records = state
        .audit_store
        .query_by_run(run_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "runId": run_id, "records": records }));
    Ok(())
}
