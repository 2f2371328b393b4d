//! HTTP API routers, one module per resource.

pub mod audit;
pub mod execute;
pub mod schedules;
pub mod workflows;

use axum::http::HeaderMap;
use axum::Router;

use durow_core::{CapabilityToken, SharedState};

/// Header carrying the caller's capability token as JSON. Transport
/// encoding is a local-adapter choice; the engine only sees the decoded
/// token.
pub const TOKEN_HEADER: &str = "x-capability-token";

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .nest("/api/workflows", workflows::router())
        .nest("/api/schedules", schedules::router())
        .nest("/api/execute", execute::router())
        .nest("/api/runs", audit::router())
}

/// Decode the capability token from request headers. Absent or malformed
/// headers yield `None`; `authorize` turns that into 401.
pub(crate) fn token_from_headers(headers: &HeaderMap) -> Option<CapabilityToken> {
    let raw = headers.get(TOKEN_HEADER)?.to_str().ok()?;
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Utc;

    #[test]
    fn test_token_decoding() {
        let mut headers = HeaderMap::new();
        assert!(token_from_headers(&headers).is_none());

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("not json"));
        assert!(token_from_headers(&headers).is_none());

        let token = CapabilityToken {
            subject: "cli".to_string(),
            scopes: vec!["worker:execute".to_string()],
            expires_at: Utc::now(),
        };
        let raw = serde_json::to_string(&token).unwrap();
        headers.insert(TOKEN_HEADER, HeaderValue::from_str(&raw).unwrap());
        let decoded = token_from_headers(&headers).unwrap();
        assert_eq!(decoded.subject, "cli");
        assert_eq!(decoded.scopes, vec!["worker:execute"]);
    }
}
