//! Plan Lifecycle Handlers
//!
//! Generation, retrieval and approval of execution plans. Generated plans
//! are held in the in-memory plan store until they expire; approval and
//! execution work from the stored plan id.

use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::info;
use validator::Validate;

use crate::{
    error::{ExecutorError, Result},
    models::{ApprovalResponse, ApprovePlanRequest, CreatePlanRequest, PlanResponse},
    server::{AppState, StoredPlan},
};
use cloudward_shared::{CostAlertType, ExecutionContext};

/// Generate an execution plan
///
/// Validates the action against the permission boundary, assembles the
/// batched plan with cost, risk and duration estimates, and runs it
/// through the cost anomaly guard before storing it for approval and
/// execution.
pub async fn create_plan(
    State(state): State<AppState>,
    Json(request): Json<CreatePlanRequest>,
) -> Result<Json<PlanResponse>> {
    request.validate()?;

    let connection = state.connections().get(&request.connection_id).await?;
    if connection.customer_id != request.customer_id {
        return Err(ExecutorError::InvalidRequest(format!(
            "connection {} does not belong to customer {}",
            request.connection_id, request.customer_id
        )));
    }

    let user_id = request.user_id.clone();
    let customer_id = request.customer_id.clone();
    let connection_id = request.connection_id.clone();
    let monthly_baseline = request.monthly_baseline;
    let action = request.into_validated_action();

    let plan = state.planner().generate(&action, &connection, None).await?;

    let validation = state.cost_guard().validate(
        &plan,
        &customer_id,
        monthly_baseline,
        &connection.allowed_regions,
    );
    if !validation.allowed {
        let reason = validation
            .reason
            .unwrap_or_else(|| "cost validation failed".to_string());
        return Err(match validation.alert_type {
            Some(CostAlertType::RateLimit) => ExecutorError::RateLimited(reason),
            _ => ExecutorError::CostRejected(reason),
        });
    }

    state.plans().insert(StoredPlan {
        plan: plan.clone(),
        customer_id: customer_id.clone(),
        connection_id,
        created_by: user_id,
    });

    info!(
        plan_id = %plan.plan_id,
        customer_id = %customer_id,
        requires_approval = plan.summary.requires_approval,
        "plan stored and ready for approval"
    );
    Ok(Json(PlanResponse::from_plan(plan)))
}

/// Fetch a stored plan
///
/// Expired plans are evicted on access and reported as expired; callers
/// must regenerate.
pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Json<PlanResponse>> {
    let record = state
        .plans()
        .get(&plan_id)
        .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.clone()))?;

    if record.plan.is_expired() {
        state.plans().remove(&plan_id);
        return Err(ExecutorError::PlanExpired(format!(
            "plan {} expired at {}",
            plan_id, record.plan.expires_at
        )));
    }

    Ok(Json(PlanResponse::from_plan(record.plan)))
}

/// Approve a stored plan
///
/// Issues a single-use approval token bound to this plan and user. The
/// same user must present the token at execution time.
pub async fn approve_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    Json(request): Json<ApprovePlanRequest>,
) -> Result<Json<ApprovalResponse>> {
    request.validate()?;

    let record = state
        .plans()
        .get(&plan_id)
        .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.clone()))?;

    let context = ExecutionContext {
        user_id: request.user_id.clone(),
        customer_id: record.customer_id.clone(),
        connection_id: record.connection_id.clone(),
    };
    let grant = state.engine().issue_approval(&record.plan, &context)?;

    Ok(Json(ApprovalResponse {
        plan_id: grant.plan_id,
        approval_token: grant.token,
        expires_at: grant.expires_at,
        approved_by: request.user_id,
    }))
}
