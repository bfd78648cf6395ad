//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::RegistryStats;
use crate::metrics::RelayMetrics;
use crate::server::AppState;
use crate::websocket::RelayOutcome;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub closing: bool,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub pending: usize,
    pub authenticated: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: RegistryStats,
    pub room_members: usize,
    pub relay: RelayStats,
    pub authenticator: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub delivered: u64,
    pub malformed: u64,
    pub spoofed: u64,
    pub offline: u64,
    pub send_failed: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let closing = state.hub.is_closing();
    let registry = &state.hub.registry;

    Json(HealthResponse {
        status: if closing { "closing" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        closing,
        connections: ConnectionHealthResponse {
            pending: registry.pending_count(),
            authenticated: registry.authenticated_count(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let relay_count = |outcome: RelayOutcome| RelayMetrics::count(outcome.as_str());

    Json(StatsResponse {
        connections: state.hub.registry.stats(),
        room_members: state.hub.rooms.len().await,
        relay: RelayStats {
            delivered: relay_count(RelayOutcome::Delivered),
            malformed: relay_count(RelayOutcome::Malformed),
            spoofed: relay_count(RelayOutcome::Spoofed),
            offline: relay_count(RelayOutcome::Offline),
            send_failed: relay_count(RelayOutcome::SendFailed),
        },
        authenticator: state.hub.authenticator.name(),
    })
}
