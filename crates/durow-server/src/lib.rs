//! Durow HTTP server.
//!
//! A thin axum adapter over `durow-core`: routers per resource, the shared
//! `EngineState` as axum state, and capability tokens carried in the
//! `x-capability-token` header. This crate can be used standalone (via the
//! CLI) or embedded in another application.

pub mod api;

use std::net::SocketAddr;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use durow_core::registry::CapabilityProvider;
use durow_core::{Database, EngineConfig, EngineState, SharedState};

/// Configuration for the Durow backend server.
pub struct ServerConfig {
    pub host: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            engine: EngineConfig::from_env(),
        }
    }
}

/// Create a shared `EngineState` from engine config and a provider
/// manifest, and start its background work (recovery pass + schedule
/// timer loop).
///
/// Useful when the state is shared between the HTTP server and other
/// consumers (e.g. the CLI's direct-execution path).
pub async fn create_app_state(
    engine: EngineConfig,
    providers: Vec<Box<dyn CapabilityProvider>>,
) -> Result<SharedState, String> {
    let db = Database::open(&engine.db_path)
        .map_err(|e| format!("Failed to open database: {}", e))?;

    let state = EngineState::build(engine, providers, db)
        .map_err(|e| format!("Failed to build engine state: {}", e))?;

    // Dropping the handle leaves the loop running for the process lifetime.
    let _scheduler = state
        .start_background()
        .await
        .map_err(|e| format!("Failed to start background work: {}", e))?;

    Ok(state)
}

/// Start the backend server. Returns the actual address it listens on.
pub async fn start_server(
    config: ServerConfig,
    providers: Vec<Box<dyn CapabilityProvider>>,
) -> Result<SocketAddr, String> {
    tracing::info!(
        "Starting Durow backend server on {}:{}",
        config.host,
        config.engine.port
    );

    let port = config.engine.port;
    let state = create_app_state(config.engine, providers).await?;

    start_server_with_state(&config.host, port, state).await
}

/// Start the HTTP server with a pre-built `EngineState`.
pub async fn start_server_with_state(
    host: &str,
    port: u16,
    state: SharedState,
) -> Result<SocketAddr, String> {
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Durow backend server listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}

/// Build the full router over a shared state.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "durow-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
