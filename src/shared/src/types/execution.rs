//! Execution lifecycle types
//!
//! Results, progress events, and approval grants produced by the execution
//! engine and consumed by API callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::plan::{ExecutionStep, StepStatus};

/// Terminal status of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every step completed.
    Completed,
    /// Some steps completed before a failure; no rollback ran.
    Partial,
    /// No step completed.
    Failed,
    /// A step failed and the rollback plan ran.
    RolledBack,
    /// The owner cancelled between steps; no rollback ran.
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Partial => write!(f, "partial"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::RolledBack => write!(f, "rolled_back"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Who is executing, against which customer and connection. The user must
/// match the approval token's binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub user_id: String,
    pub customer_id: String,
    pub connection_id: String,
}

/// Progress event emitted before and after each step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub plan_id: String,
    pub step_id: Option<String>,
    pub current_step: u32,
    pub total_steps: u32,
    pub percent: f32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal snapshot of one step after execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub action: String,
    pub status: StepStatus,
    pub message: Option<String>,
    pub request_ids: Vec<String>,
}

impl StepOutcome {
    pub fn from_step(step: &ExecutionStep) -> Self {
        Self {
            step_id: step.step_id.clone(),
            action: step.action.clone(),
            status: step.status,
            message: step.result.as_ref().map(|r| r.message.clone()),
            request_ids: step
                .result
                .as_ref()
                .map(|r| r.request_ids.clone())
                .unwrap_or_default(),
        }
    }
}

/// Result of one plan execution, including per-step terminal statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub steps_completed: u32,
    pub steps_total: u32,
    pub steps: Vec<StepOutcome>,
    pub rollback_executed: bool,
    /// Terminal statuses of the rollback plan's steps, empty when no
    /// rollback ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_steps: Vec<StepOutcome>,
    pub error: Option<String>,
    pub api_calls_made: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A freshly issued approval: the opaque token plus its expiry. The token
/// authorizes exactly one execution of exactly one plan by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGrant {
    pub token: String,
    pub plan_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationResult {
    pub success: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn test_step_outcome_without_result() {
        let step = ExecutionStep {
            step_id: "step-1".to_string(),
            order: 0,
            service: "rds".to_string(),
            action: "rds.stop".to_string(),
            description: "Stop database".to_string(),
            resources: vec![],
            impact: crate::types::plan::StepImpact::none(),
            api_calls: vec![],
            depends_on: vec![],
            status: StepStatus::Pending,
            result: None,
        };

        let outcome = StepOutcome::from_step(&step);
        assert_eq!(outcome.status, StepStatus::Pending);
        assert!(outcome.message.is_none());
        assert!(outcome.request_ids.is_empty());
    }
}
