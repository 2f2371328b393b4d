//! `durow server` — Start the Durow HTTP backend server.

use durow_core::EngineConfig;
use durow_server::ServerConfig;

pub async fn run(host: String, port: u16, db_path: String) -> Result<(), String> {
    let mut engine = EngineConfig::from_env();
    engine.db_path = db_path;
    engine.port = port;

    let config = ServerConfig {
        host: host.clone(),
        engine,
    };

    println!("Starting Durow server on {}:{}...", host, port);

    let addr = durow_server::start_server(config, vec![]).await?;
    println!("Durow server listening on http://{}", addr);

    // Keep the process running until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    Ok(())
}
