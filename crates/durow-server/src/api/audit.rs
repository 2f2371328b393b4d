use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};

use durow_core::security::{authorize, scopes};
use durow_core::{EngineError, SharedState};

use super::token_from_headers;

pub fn router() -> Router<SharedState> {
    Router::new().route("/{run_id}/audit", get(get_run_audit))
}

/// GET /api/runs/{runId}/audit — the run's audit trail in insertion order.
async fn get_run_audit(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::READ)?;

    let records = state.audit_store.query_by_run(&run_id).await?;
    if records.is_empty() {
        // Distinguish "no trail yet" from "no such run".
        state.orchestrator.get_status(&run_id).await?;
    }
    Ok(Json(serde_json::json!({ "runId": run_id, "records": records })))
}
