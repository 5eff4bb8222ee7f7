//! Status Handlers

use axum::{extract::State, response::Json};
use chrono::Utc;
use tracing::info;

use crate::{models::ServiceStatusResponse, server::AppState};

/// Get service status
///
/// Operational snapshot: uptime, store sizes, and the governance flags
/// that gate execution right now.
pub async fn service_status(State(state): State<AppState>) -> Json<ServiceStatusResponse> {
    let switches = state.kill_switches().status();

    let status = ServiceStatusResponse {
        service: "action-executor".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment.clone(),
        uptime_seconds: state.uptime_seconds(),
        active_executions: state.engine().active_count(),
        stored_plans: state.plans().len(),
        global_kill_switch_active: switches.global_active,
        read_only_mode: switches.read_only_active,
        timestamp: Utc::now(),
    };

    info!("Service status requested");
    Json(status)
}
