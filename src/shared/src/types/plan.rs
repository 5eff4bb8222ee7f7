//! Execution plan types
//!
//! An `ExecutionPlan` is the unit of governed work: an ordered, batched
//! sequence of steps derived from one validated action descriptor, carrying
//! cost/risk/duration estimates, an optional inverse rollback plan, and a
//! fixed expiry. Plans are ephemeral; they live in process memory only and
//! must never execute after `expires_at`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// RISK AND STATUS
// ============================================================================

/// Coarse severity classification attached to each step and rolled up into
/// the plan-level risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Numeric score used for plan-level aggregation.
    pub fn score(&self) -> u8 {
        match self {
            RiskLevel::Low => 20,
            RiskLevel::Medium => 50,
            RiskLevel::High => 75,
            RiskLevel::Critical => 100,
        }
    }

    /// Inverse of `score`, for reconstructing a level from a plan summary.
    pub fn from_score(score: u8) -> Self {
        match score {
            s if s >= 100 => RiskLevel::Critical,
            s if s >= 75 => RiskLevel::High,
            s if s >= 50 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Low
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Per-step lifecycle status, mutated in place by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Pending
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

// ============================================================================
// STEP COMPONENTS
// ============================================================================

/// One cloud API call declared by a step. Parameters are provider-shaped
/// JSON; `expected_duration_ms` feeds the plan duration estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCall {
    pub service: String,
    pub operation: String,
    pub parameters: serde_json::Value,
    pub expected_duration_ms: u64,
}

/// Predicted impact of a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepImpact {
    pub resource_count: u32,
    /// Signed monthly cost estimate in USD. Negative values are savings.
    pub cost_change: f64,
    pub reversible: bool,
    pub downtime: bool,
    pub data_loss: bool,
    pub risk_level: RiskLevel,
}

impl StepImpact {
    /// Impact of a pre/post-check step: touches nothing, costs nothing.
    pub fn none() -> Self {
        Self {
            resource_count: 0,
            cost_change: 0.0,
            reversible: true,
            downtime: false,
            data_loss: false,
            risk_level: RiskLevel::Low,
        }
    }
}

/// Outcome recorded on a step once it reaches a terminal status. Provider
/// request ids are retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    pub request_ids: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// One ordered unit of an execution plan. Dependencies form a simple chain
/// (each step depends on at most its predecessor), not a general DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: String,
    pub order: u32,
    pub service: String,
    /// Dot-namespaced action (`ec2.stop`) or a `precheck:`/`postcheck:` tag.
    pub action: String,
    pub description: String,
    pub resources: Vec<String>,
    pub impact: StepImpact,
    pub api_calls: Vec<ApiCall>,
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    pub result: Option<StepResult>,
}

impl ExecutionStep {
    /// Whether this step is a pre/post-check rather than a mutating action.
    pub fn is_check(&self) -> bool {
        self.action.starts_with("precheck:") || self.action.starts_with("postcheck:")
    }
}

// ============================================================================
// PLAN
// ============================================================================

/// Aggregated view of a plan used for admission decisions and display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_steps: u32,
    pub estimated_duration_ms: u64,
    /// Signed monthly cost estimate in USD summed over all steps.
    pub estimated_cost_impact: f64,
    /// Maximum per-step risk mapped onto 20/50/75/100.
    pub risk_score: u8,
    pub resources_affected: u32,
    pub services_affected: Vec<String>,
    pub requires_approval: bool,
    /// False if any step is irreversible.
    pub reversible: bool,
}

/// Ordered, batched plan for one governed action. Created once by the plan
/// generator; step status/result fields are the only mutation afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    /// Binds the plan to the exact validated descriptor it was built from.
    pub dsl_hash: String,
    pub dsl_version: String,
    pub steps: Vec<ExecutionStep>,
    pub summary: PlanSummary,
    /// Regions the plan touches, resolved at generation time.
    pub regions: Vec<String>,
    pub visualization: Option<String>,
    pub rollback_plan: Option<Box<ExecutionPlan>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// A plan must never execute after its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time remaining before expiry; zero once expired.
    pub fn time_to_expiry(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }

    /// The service of the first mutating step, used for kill-switch checks.
    pub fn primary_service(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| !s.is_check())
            .map(|s| s.service.as_str())
    }

    /// The action of the first mutating step.
    pub fn primary_action(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| !s.is_check())
            .map(|s| s.action.as_str())
    }

    /// Total declared API calls across all steps.
    pub fn total_api_calls(&self) -> u64 {
        self.steps.iter().map(|s| s.api_calls.len() as u64).sum()
    }
}

// ============================================================================
// VALIDATED ACTION DESCRIPTOR
// ============================================================================

/// The already-validated, versioned action descriptor the plan generator
/// consumes. Produced upstream by the intent/DSL parser; `dsl_hash` and
/// `dsl_version` travel onto the plan so stale descriptors are rejectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedAction {
    /// Dot-namespaced action identifier, e.g. `ec2.stop`.
    pub action: String,
    /// Explicit target resource identifiers. May be empty.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Explicit regions; when empty the connection's allowed regions apply.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Action-specific parameters, e.g. a target instance class for resize.
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub dsl_hash: String,
    pub dsl_version: String,
    /// Overrides the action type's default approval requirement when set.
    #[serde(default)]
    pub requires_approval: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step(order: u32, action: &str, reversible: bool) -> ExecutionStep {
        ExecutionStep {
            step_id: format!("step-{}", order),
            order,
            service: "ec2".to_string(),
            action: action.to_string(),
            description: format!("{} step", action),
            resources: vec!["i-001".to_string()],
            impact: StepImpact {
                resource_count: 1,
                cost_change: -10.0,
                reversible,
                downtime: true,
                data_loss: false,
                risk_level: RiskLevel::Medium,
            },
            api_calls: vec![ApiCall {
                service: "ec2".to_string(),
                operation: "StopInstances".to_string(),
                parameters: serde_json::json!({"InstanceIds": ["i-001"]}),
                expected_duration_ms: 5_000,
            }],
            depends_on: vec![],
            status: StepStatus::Pending,
            result: None,
        }
    }

    fn sample_plan(expires_in_minutes: i64) -> ExecutionPlan {
        let now = Utc::now();
        ExecutionPlan {
            plan_id: "plan-1".to_string(),
            dsl_hash: "abc123".to_string(),
            dsl_version: "1.0".to_string(),
            steps: vec![sample_step(0, "precheck:permissions", true), sample_step(1, "ec2.stop", true)],
            summary: PlanSummary {
                total_steps: 2,
                estimated_duration_ms: 10_000,
                estimated_cost_impact: -10.0,
                risk_score: 50,
                resources_affected: 1,
                services_affected: vec!["ec2".to_string()],
                requires_approval: true,
                reversible: true,
            },
            regions: vec!["us-east-1".to_string()],
            visualization: None,
            rollback_plan: None,
            created_at: now,
            expires_at: now + Duration::minutes(expires_in_minutes),
        }
    }

    #[test]
    fn test_risk_level_scores() {
        assert_eq!(RiskLevel::Low.score(), 20);
        assert_eq!(RiskLevel::Medium.score(), 50);
        assert_eq!(RiskLevel::High.score(), 75);
        assert_eq!(RiskLevel::Critical.score(), 100);
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        let max = [RiskLevel::Medium, RiskLevel::Critical, RiskLevel::Low]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(max, RiskLevel::Critical);
    }

    #[test]
    fn test_step_status_serialization() {
        let json = serde_json::to_string(&StepStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");

        let parsed: StepStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, StepStatus::Completed);
    }

    #[test]
    fn test_check_step_detection() {
        assert!(sample_step(0, "precheck:backup", true).is_check());
        assert!(sample_step(0, "postcheck:verify_state", true).is_check());
        assert!(!sample_step(0, "ec2.stop", true).is_check());
    }

    #[test]
    fn test_plan_expiry() {
        assert!(!sample_plan(15).is_expired());
        assert!(sample_plan(-1).is_expired());
        assert_eq!(sample_plan(-1).time_to_expiry(), Duration::zero());
    }

    #[test]
    fn test_primary_service_skips_checks() {
        let plan = sample_plan(15);
        assert_eq!(plan.primary_service(), Some("ec2"));
        assert_eq!(plan.primary_action(), Some("ec2.stop"));
    }

    #[test]
    fn test_total_api_calls() {
        assert_eq!(sample_plan(15).total_api_calls(), 2);
    }
}
