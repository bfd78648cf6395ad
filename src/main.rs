use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webrtc_signaling_relay::auth::{create_authenticator, outcome_channel};
use webrtc_signaling_relay::config::Settings;
use webrtc_signaling_relay::server::{create_app, AppState};
use webrtc_signaling_relay::shutdown::ShutdownController;
use webrtc_signaling_relay::tasks::InvalidationSweeper;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let (outcome_tx, outcome_rx) = outcome_channel(settings.auth.outcome_buffer);
    let authenticator = create_authenticator(&settings.auth, &settings.jwt, outcome_tx)?;

    let state = AppState::new(settings.clone(), authenticator);
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Apply authentication results in the background
    let coordinator_handle = tokio::spawn(
        state
            .coordinator
            .clone()
            .run(outcome_rx, shutdown_tx.subscribe()),
    );

    let sweeper = InvalidationSweeper::new(
        state.hub.clone(),
        settings.signaling.clone(),
        shutdown_tx.subscribe(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    let controller = Arc::new(ShutdownController::new(
        state.hub.clone(),
        shutdown_tx,
        Some(sweeper_handle),
        settings.shutdown.clone(),
    ));

    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_handler(controller))
    .await?;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = coordinator_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal_handler(controller: Arc<ShutdownController>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
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

    // Drain sockets before axum stops accepting
    controller.stop().await;
}
