use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use durow_core::security::{authorize, scopes};
use durow_core::{EngineError, SharedState, WorkflowDefinition};

use super::token_from_headers;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", post(start_workflow))
        .route("/{run_id}", get(get_run))
        .route("/{run_id}/cancel", post(cancel_run))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartWorkflowRequest {
    /// Name of a registered workflow; mutually exclusive with `definition`.
    workflow_name: Option<String>,
    /// Inline definition for ad-hoc runs.
    definition: Option<WorkflowDefinition>,
    #[serde(default)]
    input: serde_json::Value,
    tenant_id: Option<String>,
    dedupe_key: Option<String>,
}

/// POST /api/workflows — start a run. A dedupe-key collision returns the
/// existing run with `alreadyActive: true`.
async fn start_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<StartWorkflowRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::EXECUTE)?;

    let tenant = body
        .tenant_id
        .unwrap_or_else(|| state.config.default_tenant.clone());

    let handle = match (body.definition, body.workflow_name) {
        (Some(definition), _) => {
            state
                .orchestrator
                .start_workflow(definition, body.input, &tenant, body.dedupe_key)
                .await?
        }
        (None, Some(name)) => {
            state
                .orchestrator
                .start_by_name(&name, body.input, &tenant, body.dedupe_key)
                .await?
        }
        (None, None) => {
            return Err(EngineError::BadRequest(
                "Either 'workflowName' or 'definition' is required".to_string(),
            ));
        }
    };

    Ok(Json(serde_json::json!({ "run": handle })))
}

/// GET /api/workflows/{runId} — point-in-time run status.
async fn get_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::READ)?;

    let view = state.orchestrator.get_status(&run_id).await?;
    Ok(Json(serde_json::json!({ "run": view })))
}

/// POST /api/workflows/{runId}/cancel
async fn cancel_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::EXECUTE)?;

    state.orchestrator.cancel(&run_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true, "runId": run_id })))
}
