use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use durow_core::sandbox::{CodeTask, ExecTrace};
use durow_core::security::{authorize, scopes};
use durow_core::{CancelToken, EngineError, SharedState};

use super::token_from_headers;

pub fn router() -> Router<SharedState> {
    Router::new().route("/", post(execute_code))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteCodeRequest {
    kind: String,
    code: String,
    tenant_id: Option<String>,
    timeout_ms: Option<u64>,
    cpu_time_ms: Option<u64>,
    memory_bytes: Option<u64>,
}

/// POST /api/execute — run code in the sandbox directly, outside any
/// workflow. The execution still shows up in the audit trail under a
/// generated run id.
async fn execute_code(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteCodeRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let token = token_from_headers(&headers);
    authorize(token.as_ref(), scopes::EXECUTE)?;

    let mut spec = state.executor.default_spec();
    if let Some(ms) = body.timeout_ms {
        spec.wall_timeout_ms = ms;
    }
    if let Some(ms) = body.cpu_time_ms {
        spec.cpu_time_ms = ms;
    }
    if let Some(bytes) = body.memory_bytes {
        spec.memory_bytes = bytes;
    }

    let tenant = body
        .tenant_id
        .unwrap_or_else(|| state.config.default_tenant.clone());

    let run_id = format!("exec-{}", Uuid::new_v4());
    let task = CodeTask {
        kind: body.kind.clone(),
        code: body.code,
    };
    let trace = ExecTrace {
        run_id: run_id.clone(),
        tenant_id: tenant,
        step_id: body.kind,
        attempt: 1,
    };

    let result = state
        .executor
        .execute(&task, &spec, &CancelToken::never(), &trace)
        .await?;

    Ok(Json(serde_json::json!({ "runId": run_id, "result": result })))
}
