//! Health Check Handlers

use axum::{extract::State, response::Json};
use chrono::Utc;

use crate::{
    models::{ComponentHealth, HealthResponse},
    server::AppState,
};

/// Liveness probe with per-component summaries
///
/// Reports `degraded` when a global freeze or read-only mode is active.
/// The process is still up and serving admin traffic in that state; the
/// status tells operators that executions are currently refused.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let switches = state.kill_switches().status();
    let frozen = switches.global_active || switches.read_only_active;

    let components = vec![
        ComponentHealth {
            name: "kill_switch_registry".to_string(),
            status: if frozen { "frozen" } else { "ok" }.to_string(),
            detail: frozen.then(|| {
                format!(
                    "global={} read_only={}",
                    switches.global_active, switches.read_only_active
                )
            }),
        },
        ComponentHealth {
            name: "execution_engine".to_string(),
            status: "ok".to_string(),
            detail: Some(format!(
                "{} active executions",
                state.engine().active_count()
            )),
        },
        ComponentHealth {
            name: "plan_store".to_string(),
            status: "ok".to_string(),
            detail: Some(format!("{} stored plans", state.plans().len())),
        },
        ComponentHealth {
            name: "cost_guard".to_string(),
            status: "ok".to_string(),
            detail: None,
        },
    ];

    Json(HealthResponse {
        status: if frozen { "degraded" } else { "healthy" }.to_string(),
        service: "action-executor".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        components,
    })
}
