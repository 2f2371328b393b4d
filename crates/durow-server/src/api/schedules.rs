use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use durow_core::security::{authorize, scopes};
use durow_core::{CreateScheduleInput, EngineError, SharedState};

use super::token_from_headers;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route("/{id}", get(get_schedule).delete(delete_schedule))
        .route("/{id}/pause", post(pause_schedule))
        .route("/{id}/unpause", post(unpause_schedule))
        .route("/{id}/trigger", post(trigger_schedule))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantQuery {
    tenant_id: Option<String>,
}

impl TenantQuery {
    fn resolve(&self, state: &SharedState) -> String {
        self.tenant_id
            .clone()
            .unwrap_or_else(|| state.config.default_tenant.clone())
    }
}

async fn list_schedules(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::READ)?;

    let schedules = state.scheduler.list(&q.resolve(&state)).await?;
    Ok(Json(serde_json::json!({ "schedules": schedules })))
}

/// POST /api/schedules — idempotent create. Re-issuing an identical
/// definition returns the existing schedule; a differing one is a 409.
async fn create_schedule(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateScheduleInput>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::SCHEDULE)?;

    let (schedule, already_existed) = state.scheduler.create(body).await?;
    Ok(Json(serde_json::json!({
        "schedule": schedule,
        "alreadyExisted": already_existed,
    })))
}

async fn get_schedule(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::READ)?;

    let schedule = state.scheduler.get(&q.resolve(&state), &id).await?;
    Ok(Json(serde_json::json!({ "schedule": schedule })))
}

async fn pause_schedule(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::SCHEDULE)?;

    state.scheduler.pause(&q.resolve(&state), &id).await?;
    Ok(Json(serde_json::json!({ "paused": true, "id": id })))
}

async fn unpause_schedule(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::SCHEDULE)?;

    state.scheduler.unpause(&q.resolve(&state), &id).await?;
    Ok(Json(serde_json::json!({ "paused": false, "id": id })))
}

/// POST /api/schedules/{id}/trigger — fire immediately, outside the cron
/// cadence.
async fn trigger_schedule(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::SCHEDULE)?;

    let run_id = state.scheduler.trigger(&q.resolve(&state), &id).await?;
    Ok(Json(serde_json::json!({ "triggered": true, "runId": run_id })))
}

async fn delete_schedule(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::SCHEDULE)?;

    let deleted = state.scheduler.delete(&q.resolve(&state), &id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
