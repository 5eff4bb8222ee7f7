//! API request and response models for the action executor.
//!
//! These are the HTTP-facing shapes only. The domain vocabulary (plans,
//! steps, execution results, governance types) lives in `cloudward_shared`
//! and is reused directly wherever a handler returns it unmodified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use cloudward_shared::{
    Connection, CostThresholds, ExecutionMode, ExecutionPlan, KillSwitchScope, ValidatedAction,
};

// ============================================================================
// PLAN REQUESTS
// ============================================================================

/// Request to generate an execution plan from one validated action.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePlanRequest {
    /// Dot-namespaced action identifier, e.g. `ec2.stop`
    #[validate(length(min = 1, max = 100))]
    pub action: String,

    /// Target resource identifiers
    #[serde(default)]
    pub resources: Vec<String>,

    /// Explicit regions; empty means the connection's allowlist applies
    #[serde(default)]
    pub regions: Vec<String>,

    /// Action-specific parameters, e.g. a target instance class
    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Requesting user
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,

    /// Customer the action belongs to
    #[validate(length(min = 1, max = 100))]
    pub customer_id: String,

    /// Cloud connection to plan against
    #[validate(length(min = 1, max = 100))]
    pub connection_id: String,

    /// Current monthly spend used as the cost-prediction baseline
    pub monthly_baseline: Option<f64>,

    /// Overrides the action type's default approval requirement
    pub requires_approval: Option<bool>,

    /// Hash of the upstream action descriptor; generated when absent
    pub dsl_hash: Option<String>,

    /// Version of the upstream action descriptor schema
    pub dsl_version: Option<String>,
}

impl CreatePlanRequest {
    /// Convert into the descriptor the plan generator consumes.
    pub fn into_validated_action(self) -> ValidatedAction {
        ValidatedAction {
            action: self.action,
            resources: self.resources,
            regions: self.regions,
            parameters: self.parameters,
            dsl_hash: self
                .dsl_hash
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            dsl_version: self.dsl_version.unwrap_or_else(|| "v1".to_string()),
            requires_approval: self.requires_approval,
        }
    }
}

/// Request to approve a stored plan.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApprovePlanRequest {
    /// User granting the approval; execution is bound to this user
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
}

/// Request to execute a stored plan.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutePlanRequest {
    /// Plan to execute
    #[validate(length(min = 1, max = 100))]
    pub plan_id: String,

    /// Approval token; required when the plan's summary requires approval
    pub approval_token: Option<String>,

    /// Executing user; must match the approving user for gated plans
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
}

/// Request to cancel an in-flight execution.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelExecutionRequest {
    /// Requesting user; only the execution owner may cancel
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
}

// ============================================================================
// PLAN RESPONSES
// ============================================================================

/// Response carrying a freshly generated (or fetched) plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    /// The full plan, including steps, summary and rollback plan
    pub plan: ExecutionPlan,

    /// Seconds until the plan expires and must be regenerated
    pub expires_in_seconds: i64,
}

impl PlanResponse {
    pub fn from_plan(plan: ExecutionPlan) -> Self {
        let expires_in_seconds = plan.time_to_expiry().num_seconds();
        Self {
            plan,
            expires_in_seconds,
        }
    }
}

/// Response to a plan approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Plan the token is bound to
    pub plan_id: String,

    /// Single-use opaque token to present at execution time
    pub approval_token: String,

    /// Token expiry
    pub expires_at: DateTime<Utc>,

    /// User the token is bound to
    pub approved_by: String,
}

// ============================================================================
// CONNECTION REQUESTS
// ============================================================================

/// Request to create or replace a cloud connection record.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpsertConnectionRequest {
    #[validate(length(min = 1, max = 100))]
    pub connection_id: String,

    #[validate(length(min = 1, max = 100))]
    pub customer_id: String,

    /// Cloud provider identifier, e.g. `aws`
    #[validate(length(min = 1, max = 50))]
    pub provider: String,

    #[validate(length(max = 200))]
    pub display_name: Option<String>,

    /// Whether executions run simulated or against real infrastructure
    pub execution_mode: ExecutionMode,

    /// When the simulation observation period began
    pub simulation_started_at: Option<DateTime<Utc>>,

    /// Days of simulation required before live execution; defaults to 7
    pub simulation_days_required: Option<u32>,

    /// Ordered region allowlist; the first entry is the default region
    #[validate(length(min = 1))]
    pub allowed_regions: Vec<String>,
}

impl UpsertConnectionRequest {
    /// Build the connection record, preserving usage counters from a
    /// previous record when the connection already exists.
    pub fn into_connection(self, existing: Option<&Connection>) -> Connection {
        Connection {
            connection_id: self.connection_id,
            customer_id: self.customer_id,
            provider: self.provider,
            display_name: self.display_name,
            execution_mode: self.execution_mode,
            simulation_started_at: self.simulation_started_at,
            simulation_days_required: self.simulation_days_required.unwrap_or(7),
            allowed_regions: self.allowed_regions,
            last_used: existing.and_then(|c| c.last_used),
            total_executions: existing.map(|c| c.total_executions).unwrap_or(0),
            total_api_calls: existing.map(|c| c.total_api_calls).unwrap_or(0),
            created_at: existing.map(|c| c.created_at).unwrap_or_else(Utc::now),
        }
    }
}

// ============================================================================
// ADMIN REQUESTS
// ============================================================================

/// Request to activate a kill switch at some scope.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ActivateKillSwitchRequest {
    /// Scope to freeze
    pub scope: KillSwitchScope,

    /// Customer, service or connection id; required for non-global scopes
    pub target_id: Option<String>,

    /// Why the switch is being thrown
    #[validate(length(min = 1, max = 500))]
    pub reason: String,

    /// Operator activating the switch
    #[validate(length(min = 1, max = 100))]
    pub activated_by: String,

    /// Auto-expiry in minutes; global switches ignore this and never expire
    #[validate(range(min = 1, max = 10080))]
    pub expires_in_minutes: Option<i64>,

    /// Free-form operator notes
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// Request to deactivate a kill switch.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeactivateKillSwitchRequest {
    pub scope: KillSwitchScope,

    /// Required for non-global scopes
    pub target_id: Option<String>,

    #[validate(length(min = 1, max = 100))]
    pub deactivated_by: String,
}

/// Request to toggle system-wide read-only mode.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReadOnlyModeRequest {
    /// Operator requesting the change
    #[validate(length(min = 1, max = 100))]
    pub requested_by: String,

    /// Why; required when enabling
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Request to override cost thresholds for one customer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdateThresholdsRequest {
    /// Maximum predicted cost increase as a percentage of baseline
    #[validate(range(min = 0.0, max = 500.0))]
    pub cost_increase_percent: f64,

    /// Maximum predicted absolute cost increase in monthly USD
    #[validate(range(min = 0.0))]
    pub cost_increase_absolute: f64,

    /// Validation calls allowed per rate window
    #[validate(range(min = 1, max = 10000))]
    pub api_calls_per_minute: u32,

    /// Reject plans touching regions outside the connection allowlist
    pub unexpected_regions: bool,
}

impl UpdateThresholdsRequest {
    pub fn into_thresholds(self) -> CostThresholds {
        CostThresholds {
            cost_increase_percent: self.cost_increase_percent,
            cost_increase_absolute: self.cost_increase_absolute,
            api_calls_per_minute: self.api_calls_per_minute,
            unexpected_regions: self.unexpected_regions,
        }
    }
}

// ============================================================================
// QUERY PARAMETERS
// ============================================================================

/// Limit parameter for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Customer filter for the cost metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerQuery {
    pub customer_id: Option<String>,
}

// ============================================================================
// STATUS & DOCUMENTATION RESPONSES
// ============================================================================

/// Liveness response with per-component summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub components: Vec<ComponentHealth>,
}

/// Health summary for one internal component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    pub detail: Option<String>,
}

/// Service status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResponse {
    pub service: String,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
    pub active_executions: usize,
    pub stored_plans: usize,
    pub global_kill_switch_active: bool,
    pub read_only_mode: bool,
    pub timestamp: DateTime<Utc>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_plan_request_validation() {
        let request = CreatePlanRequest {
            action: "ec2.stop".to_string(),
            resources: vec!["i-001".to_string()],
            regions: vec![],
            parameters: serde_json::Value::Null,
            user_id: "user-1".to_string(),
            customer_id: "cust-1".to_string(),
            connection_id: "conn-1".to_string(),
            monthly_baseline: Some(2500.0),
            requires_approval: None,
            dsl_hash: None,
            dsl_version: None,
        };
        assert!(request.validate().is_ok());

        let mut missing_user = request.clone();
        missing_user.user_id = String::new();
        assert!(missing_user.validate().is_err());
    }

    #[test]
    fn test_into_validated_action_fills_descriptor_defaults() {
        let request = CreatePlanRequest {
            action: "ec2.stop".to_string(),
            resources: vec!["i-001".to_string()],
            regions: vec!["us-east-1".to_string()],
            parameters: serde_json::json!({"force": true}),
            user_id: "user-1".to_string(),
            customer_id: "cust-1".to_string(),
            connection_id: "conn-1".to_string(),
            monthly_baseline: None,
            requires_approval: Some(true),
            dsl_hash: None,
            dsl_version: None,
        };

        let action = request.into_validated_action();
        assert_eq!(action.action, "ec2.stop");
        assert_eq!(action.dsl_version, "v1");
        assert!(!action.dsl_hash.is_empty());
        assert_eq!(action.requires_approval, Some(true));
    }

    #[test]
    fn test_upsert_connection_preserves_counters() {
        let request = UpsertConnectionRequest {
            connection_id: "conn-1".to_string(),
            customer_id: "cust-1".to_string(),
            provider: "aws".to_string(),
            display_name: None,
            execution_mode: ExecutionMode::Live,
            simulation_started_at: None,
            simulation_days_required: None,
            allowed_regions: vec!["us-east-1".to_string()],
        };

        let mut existing = request.clone().into_connection(None);
        assert_eq!(existing.total_executions, 0);
        assert_eq!(existing.simulation_days_required, 7);

        existing.total_executions = 12;
        existing.total_api_calls = 40;
        let replaced = request.into_connection(Some(&existing));
        assert_eq!(replaced.total_executions, 12);
        assert_eq!(replaced.total_api_calls, 40);
        assert_eq!(replaced.created_at, existing.created_at);
    }

    #[test]
    fn test_kill_switch_request_requires_reason() {
        let request = ActivateKillSwitchRequest {
            scope: KillSwitchScope::Customer,
            target_id: Some("cust-1".to_string()),
            reason: String::new(),
            activated_by: "ops".to_string(),
            expires_in_minutes: Some(30),
            notes: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_threshold_request_conversion() {
        let request = UpdateThresholdsRequest {
            cost_increase_percent: 10.0,
            cost_increase_absolute: 500.0,
            api_calls_per_minute: 50,
            unexpected_regions: false,
        };
        assert!(request.validate().is_ok());

        let thresholds = request.into_thresholds();
        assert_eq!(thresholds.cost_increase_percent, 10.0);
        assert!(!thresholds.unexpected_regions);
    }
}
