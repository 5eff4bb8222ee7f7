//! Governance Administration Handlers
//!
//! Operator surface for the kill-switch registry and the cost anomaly
//! guard: activate and deactivate freezes, toggle read-only mode, inspect
//! the audit trail, and manage cost thresholds and alerts.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;
use validator::Validate;

use crate::{
    error::Result,
    killswitch::{KillSwitchRegistry, KillSwitchStatus},
    models::{
        ActivateKillSwitchRequest, CustomerQuery, DeactivateKillSwitchRequest, LimitQuery,
        ReadOnlyModeRequest, UpdateThresholdsRequest,
    },
    server::AppState,
};
use cloudward_shared::{AuditRecord, CostAlert, CostMetrics, CostThresholds, EmergencyStopMethod};

/// Outcome of a kill-switch or read-only toggle.
#[derive(Debug, Serialize)]
pub struct GovernanceActionResponse {
    /// Scope the action applied to
    pub scope: String,
    /// Target id for scoped switches
    pub target_id: Option<String>,
    /// Whether the registry state actually changed
    pub applied: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Cost metrics for one customer.
#[derive(Debug, Serialize)]
pub struct CustomerCostMetrics {
    pub customer_id: String,
    pub metrics: CostMetrics,
}

/// Global and per-customer cost metrics.
#[derive(Debug, Serialize)]
pub struct CostMetricsResponse {
    pub global: CostMetrics,
    pub customers: Vec<CustomerCostMetrics>,
}

/// Get kill-switch registry status
///
/// Point-in-time counts and flags, including read-only mode.
pub async fn kill_switch_status(State(state): State<AppState>) -> Result<Json<KillSwitchStatus>> {
    Ok(Json(state.kill_switches().status()))
}

/// Activate a kill switch
///
/// Freezes execution at the requested scope. Non-global scopes require a
/// target id; global switches ignore any expiry and stay active until an
/// operator deactivates them.
pub async fn activate_kill_switch(
    State(state): State<AppState>,
    Json(request): Json<ActivateKillSwitchRequest>,
) -> Result<Json<GovernanceActionResponse>> {
    request.validate()?;

    let expires_at = request
        .expires_in_minutes
        .map(|minutes| Utc::now() + Duration::minutes(minutes));

    state.kill_switches().activate(
        request.scope,
        request.target_id.as_deref(),
        &request.reason,
        &request.activated_by,
        expires_at,
        request.notes,
    )?;

    Ok(Json(GovernanceActionResponse {
        scope: request.scope.to_string(),
        target_id: request.target_id,
        applied: true,
        message: "kill switch activated".to_string(),
        timestamp: Utc::now(),
    }))
}

/// Deactivate a kill switch
///
/// `applied` is false when no switch was active at that scope and target.
pub async fn deactivate_kill_switch(
    State(state): State<AppState>,
    Json(request): Json<DeactivateKillSwitchRequest>,
) -> Result<Json<GovernanceActionResponse>> {
    request.validate()?;

    let removed = state.kill_switches().deactivate(
        request.scope,
        request.target_id.as_deref(),
        &request.deactivated_by,
    )?;

    Ok(Json(GovernanceActionResponse {
        scope: request.scope.to_string(),
        target_id: request.target_id,
        applied: removed,
        message: if removed {
            "kill switch deactivated".to_string()
        } else {
            "no active kill switch at that scope".to_string()
        },
        timestamp: Utc::now(),
    }))
}

/// Enable read-only mode
///
/// Blocks every mutating action system-wide while leaving reads alone.
pub async fn enable_read_only(
    State(state): State<AppState>,
    Json(request): Json<ReadOnlyModeRequest>,
) -> Result<Json<GovernanceActionResponse>> {
    request.validate()?;

    let reason = request
        .reason
        .unwrap_or_else(|| "enabled by operator".to_string());
    state
        .kill_switches()
        .enable_read_only(&request.requested_by, &reason);

    Ok(Json(GovernanceActionResponse {
        scope: "read_only".to_string(),
        target_id: None,
        applied: true,
        message: "read-only mode enabled".to_string(),
        timestamp: Utc::now(),
    }))
}

/// Disable read-only mode
pub async fn disable_read_only(
    State(state): State<AppState>,
    Json(request): Json<ReadOnlyModeRequest>,
) -> Result<Json<GovernanceActionResponse>> {
    request.validate()?;

    let removed = state
        .kill_switches()
        .disable_read_only(&request.requested_by);

    Ok(Json(GovernanceActionResponse {
        scope: "read_only".to_string(),
        target_id: None,
        applied: removed,
        message: if removed {
            "read-only mode disabled".to_string()
        } else {
            "read-only mode was not active".to_string()
        },
        timestamp: Utc::now(),
    }))
}

/// Get the kill-switch audit trail
///
/// Most recent first; `limit` defaults to 50.
pub async fn kill_switch_audit(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<AuditRecord>>> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.kill_switches().audit_log(limit)))
}

/// List emergency stop methods
///
/// Static documentation describing every way execution can be stopped,
/// including customer-side controls that work even when this service is
/// unreachable.
pub async fn emergency_stop_methods() -> Json<Vec<EmergencyStopMethod>> {
    Json(KillSwitchRegistry::emergency_stop_methods().to_vec())
}

/// Get cost metrics
///
/// Global aggregates plus per-customer breakdowns; `customer_id` narrows
/// the response to one customer.
pub async fn cost_metrics(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<CostMetricsResponse>> {
    let guard = state.cost_guard();
    let global = guard.metrics(None);

    let customers = match query.customer_id {
        Some(customer_id) => {
            let metrics = guard.metrics(Some(&customer_id));
            vec![CustomerCostMetrics {
                customer_id,
                metrics,
            }]
        }
        None => guard
            .customer_metrics()
            .into_iter()
            .map(|(customer_id, metrics)| CustomerCostMetrics {
                customer_id,
                metrics,
            })
            .collect(),
    };

    Ok(Json(CostMetricsResponse { global, customers }))
}

/// List recent cost alerts
///
/// Most recent first; `limit` defaults to 50.
pub async fn cost_alerts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<CostAlert>>> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.cost_guard().alerts(limit)))
}

/// Set cost threshold overrides for one customer
///
/// Returns the thresholds now in effect for that customer.
pub async fn update_thresholds(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Json(request): Json<UpdateThresholdsRequest>,
) -> Result<Json<CostThresholds>> {
    request.validate()?;

    let thresholds = request.into_thresholds();
    state
        .cost_guard()
        .set_thresholds(&customer_id, thresholds.clone());
    info!(customer_id = %customer_id, "cost thresholds overridden");

    Ok(Json(state.cost_guard().thresholds_for(&customer_id)))
}
