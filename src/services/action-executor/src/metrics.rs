//! Metrics Module
//!
//! JSON metrics summary for the action executor, aggregated from the
//! counters each component already keeps. Served at `/metrics/summary`.

use axum::{extract::State, response::Json};
use serde::Serialize;
use tracing::info;

use crate::{
    approvals::ApprovalStats, costguard::CostGuardStats, engine::EngineStats,
    planner::PlannerStats, server::AppState,
};

/// Metrics summary response
#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    /// Service-level metrics
    pub service: ServiceMetrics,
    /// Plan generation counters
    pub plans: PlannerStats,
    /// Execution outcome counters
    pub executions: EngineStats,
    /// Approval token counters
    pub approvals: ApprovalStats,
    /// Kill-switch registry counters and flags
    pub kill_switches: KillSwitchMetrics,
    /// Cost guard counters
    pub cost: CostGuardStats,
}

/// Service-level metrics
#[derive(Debug, Serialize)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: u64,
    /// Deployment environment
    pub environment: String,
    /// Executions currently in flight
    pub active_executions: usize,
    /// Unexpired plans held in the store
    pub stored_plans: usize,
}

/// Kill-switch registry metrics
#[derive(Debug, Serialize)]
pub struct KillSwitchMetrics {
    pub activations_total: u64,
    pub deactivations_total: u64,
    pub checks_total: u64,
    pub blocks_total: u64,
    pub expired_total: u64,
    pub global_active: bool,
    pub read_only_active: bool,
    /// Active scoped switches across customer, service and connection
    pub scoped_switches: usize,
}

/// Get metrics summary
pub async fn get_metrics_summary(State(state): State<AppState>) -> Json<MetricsSummary> {
    let switch_stats = state.kill_switches().stats();
    let switch_status = state.kill_switches().status();

    let metrics = MetricsSummary {
        service: ServiceMetrics {
            uptime_seconds: state.uptime_seconds(),
            environment: state.config.environment.clone(),
            active_executions: state.engine().active_count(),
            stored_plans: state.plans().len(),
        },
        plans: state.planner().stats(),
        executions: state.engine().stats(),
        approvals: state.approvals().stats(),
        kill_switches: KillSwitchMetrics {
            activations_total: switch_stats.activations_total,
            deactivations_total: switch_stats.deactivations_total,
            checks_total: switch_stats.checks_total,
            blocks_total: switch_stats.blocks_total,
            expired_total: switch_stats.expired_total,
            global_active: switch_status.global_active,
            read_only_active: switch_status.read_only_active,
            scoped_switches: switch_status.customer_switches
                + switch_status.service_switches
                + switch_status.connection_switches,
        },
        cost: state.cost_guard().stats(),
    };

    info!("Metrics summary generated");
    Json(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_summary_serialization() {
        let metrics = MetricsSummary {
            service: ServiceMetrics {
                uptime_seconds: 3600,
                environment: "test".to_string(),
                active_executions: 1,
                stored_plans: 3,
            },
            plans: PlannerStats::default(),
            executions: EngineStats::default(),
            approvals: ApprovalStats::default(),
            kill_switches: KillSwitchMetrics {
                activations_total: 2,
                deactivations_total: 1,
                checks_total: 40,
                blocks_total: 3,
                expired_total: 0,
                global_active: false,
                read_only_active: true,
                scoped_switches: 1,
            },
            cost: CostGuardStats::default(),
        };

        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("uptime_seconds"));
        assert!(json.contains("executions_started"));
        assert!(json.contains("read_only_active"));
    }
}
