//! `durow schedule` — administer cron schedules.

use durow_core::CreateScheduleInput;

use super::{init_state, print_json};

#[allow(clippy::too_many_arguments)]
pub async fn create(
    db_path: &str,
    id: String,
    workflow: String,
    cron: String,
    tenant: String,
    queue: String,
    enabled: bool,
) -> Result<(), String> {
    let state = init_state(db_path)?;
    let input = CreateScheduleInput {
        id,
        tenant_id: tenant,
        workflow_name: workflow,
        cron_expr: cron,
        task_queue: queue,
        enabled,
    };
    let (schedule, already_existed) = state
        .scheduler
        .create(input)
        .await
        .map_err(|e| e.to_string())?;

    if already_existed {
        println!("Schedule {} already exists (unchanged)", schedule.id);
    } else {
        println!("Created schedule {}", schedule.id);
    }
    print_json(&serde_json::to_value(schedule).unwrap_or_default());
    Ok(())
}

pub async fn list(db_path: &str, tenant: &str) -> Result<(), String> {
    let state = init_state(db_path)?;
    let schedules = state
        .scheduler
        .list(tenant)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "schedules": schedules }));
    Ok(())
}

pub async fn set_enabled(
    db_path: &str,
    tenant: &str,
    id: &str,
    enabled: bool,
) -> Result<(), String> {
    let state = init_state(db_path)?;
    let result = if enabled {
        state.scheduler.unpause(tenant, id).await
    } else {
        state.scheduler.pause(tenant, id).await
    };
    result.map_err(|e| e.to_string())?;
    println!(
        "Schedule {} {}",
        id,
        if enabled { "unpaused" } else { "paused" }
    );
    Ok(())
}

pub async fn trigger(db_path: &str, tenant: &str, id: &str) -> Result<(), String> {
    let state = init_state(db_path)?;
    let run_id = state
        .scheduler
        .trigger(tenant, id)
        .await
        .map_err(|e| e.to_string())?;
    println!("Triggered schedule {} -> run {}", id, run_id);
    Ok(())
}

pub async fn delete(db_path: &str, tenant: &str, id: &str) -> Result<(), String> {
    let state = init_state(db_path)?;
    let deleted = state
        .scheduler
        .delete(tenant, id)
        .await
        .map_err(|e| e.to_string())?;
    if deleted {
        println!("Deleted schedule {}", id);
    } else {
        println!("Schedule {} did not exist", id);
    }
    Ok(())
}
