//! Shared type definitions for the Cloudward Platform
//!
//! This module provides the type definitions used across the governed
//! execution services, ensuring consistency and type safety between the
//! action-executor core, its collaborators, and API callers.

pub mod connection;
pub mod execution;
pub mod governance;
pub mod plan;

// Re-export plan types
pub use plan::{
    ApiCall, ExecutionPlan, ExecutionStep, PlanSummary, RiskLevel, StepImpact, StepResult,
    StepStatus, ValidatedAction,
};

// Re-export connection types
pub use connection::{Connection, ExecutionMode};

// Re-export governance types
pub use governance::{
    AlertSeverity, AuditRecord, BlockedScope, CostAlert, CostAlertType, CostConfidence,
    CostMetrics, CostPrediction, CostThresholds, CostValidation, EmergencyStopMethod,
    ExecutionCheckRequest, KillSwitchEntry, KillSwitchCheck, KillSwitchScope,
};

// Re-export execution types
pub use execution::{
    ApprovalGrant, CancellationResult, ExecutionContext, ExecutionProgress, ExecutionResult,
    ExecutionStatus, StepOutcome,
};
