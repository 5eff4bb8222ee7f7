//! Service error types
//!
//! One error enum covers the whole admission/execution taxonomy so callers
//! can tell "retry later" (rate limit) from "will never succeed as
//! submitted" (permission denial) from "needs re-approval" (expired token
//! or plan). Admission failures always happen before any resource mutation.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    // Admission failures. All fail closed before mutation.
    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Plan expired: {0}")]
    PlanExpired(String),

    #[error("Kill switch active: {0}")]
    KillSwitchActive(String),

    #[error("Simulation mode: {0}")]
    SimulationBlocked(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Cost validation failed: {0}")]
    CostRejected(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    // Malformed caller input that validator derives cannot express.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Plan generation failures.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    // Infrastructure failures. Abort the attempt before any step runs.
    #[error("Credential acquisition failed: {0}")]
    CredentialAcquisition(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Ambient failures.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON envelope returned for every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: String,
    pub retryable: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExecutorError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ExecutorError::ApprovalDenied(_) => "APPROVAL_DENIED",
            ExecutorError::PlanExpired(_) => "PLAN_EXPIRED",
            ExecutorError::KillSwitchActive(_) => "KILL_SWITCH_ACTIVE",
            ExecutorError::SimulationBlocked(_) => "SIMULATION_BLOCKED",
            ExecutorError::PermissionDenied(_) => "PERMISSION_DENIED",
            ExecutorError::CostRejected(_) => "COST_REJECTED",
            ExecutorError::RateLimited(_) => "RATE_LIMITED",
            ExecutorError::InvalidRequest(_) => "INVALID_REQUEST",
            ExecutorError::UnknownAction(_) => "UNKNOWN_ACTION",
            ExecutorError::ResourceLimitExceeded(_) => "RESOURCE_LIMIT_EXCEEDED",
            ExecutorError::CredentialAcquisition(_) => "CREDENTIAL_ACQUISITION_FAILED",
            ExecutorError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            ExecutorError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            ExecutorError::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            ExecutorError::Config(_) => "CONFIGURATION_ERROR",
            ExecutorError::Validation(_) => "VALIDATION_ERROR",
            ExecutorError::Serialization(_) => "SERIALIZATION_ERROR",
            ExecutorError::Io(_) => "IO_ERROR",
            ExecutorError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ExecutorError::ApprovalDenied(_) => StatusCode::FORBIDDEN,
            ExecutorError::PlanExpired(_) => StatusCode::GONE,
            ExecutorError::KillSwitchActive(_) => StatusCode::LOCKED,
            ExecutorError::SimulationBlocked(_) => StatusCode::FORBIDDEN,
            ExecutorError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ExecutorError::CostRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ExecutorError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ExecutorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ExecutorError::UnknownAction(_) => StatusCode::BAD_REQUEST,
            ExecutorError::ResourceLimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ExecutorError::CredentialAcquisition(_) => StatusCode::BAD_GATEWAY,
            ExecutorError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            ExecutorError::PlanNotFound(_) => StatusCode::NOT_FOUND,
            ExecutorError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            ExecutorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Validation(_) => StatusCode::BAD_REQUEST,
            ExecutorError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExecutorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::RateLimited(_) => true,
            ExecutorError::CredentialAcquisition(_) => true,
            ExecutorError::Internal(_) => true,
            _ => false,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for ExecutorError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        let error_response = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
            code: format!("{}", status_code.as_u16()),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now(),
        };

        // Log by severity: governance blocks are expected operational
        // events, infrastructure failures are not.
        match &self {
            ExecutorError::Internal(_)
            | ExecutorError::Config(_)
            | ExecutorError::Serialization(_)
            | ExecutorError::Io(_) => {
                tracing::error!("Server error: {:?}", self);
            }
            ExecutorError::CredentialAcquisition(_) => {
                tracing::warn!("Collaborator error: {:?}", self);
            }
            ExecutorError::KillSwitchActive(_) | ExecutorError::SimulationBlocked(_) => {
                tracing::warn!("Execution blocked: {}", self);
            }
            _ => {
                tracing::info!("Request rejected: {}", self);
            }
        }

        (status_code, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ExecutorError::ApprovalDenied("used".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ExecutorError::PlanExpired("p1".into()).status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            ExecutorError::RateLimited("100/min".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ExecutorError::KillSwitchActive("global".into()).status_code(),
            StatusCode::LOCKED
        );
    }

    #[test]
    fn test_retryability_split() {
        assert!(ExecutorError::RateLimited("window full".into()).is_retryable());
        assert!(ExecutorError::CredentialAcquisition("sts down".into()).is_retryable());
        assert!(!ExecutorError::PermissionDenied("no ec2:StopInstances".into()).is_retryable());
        assert!(!ExecutorError::ApprovalDenied("already used".into()).is_retryable());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            ExecutorError::CostRejected("over threshold".into()).error_code(),
            "COST_REJECTED"
        );
        assert_eq!(
            ExecutorError::UnknownAction("ec2.dance".into()).error_code(),
            "UNKNOWN_ACTION"
        );
    }
}
