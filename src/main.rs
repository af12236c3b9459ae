use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use market_stream_manager::config::Settings;
use market_stream_manager::connection_manager::ConnectionManager;
use market_stream_manager::server::{create_app, AppState};
use market_stream_manager::telemetry::init_telemetry;
use market_stream_manager::transport::WebSocketTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; keep the guard alive until exit
    let _telemetry = init_telemetry(&settings.log, &settings.otel)?;
    tracing::info!(
        endpoint = %settings.stream.endpoint,
        max_retry_attempts = settings.stream.max_retry_attempts,
        "Configuration loaded"
    );

    // Create the connection manager (also starts the idle reaper)
    let connection_manager = Arc::new(ConnectionManager::new(
        settings.stream.clone(),
        Arc::new(WebSocketTransport::new()),
    )?);

    let state = AppState::new(settings.clone(), connection_manager.clone());
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    tracing::info!("Closing upstream connections...");
    connection_manager.destroy();

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
