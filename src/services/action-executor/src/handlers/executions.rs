//! Execution Handlers
//!
//! Execution admission and lifecycle: run a stored plan, stream progress
//! events, cancel in-flight work, and list what is currently running.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
};
use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{info, warn};
use validator::Validate;

use crate::{
    engine::ActiveExecutionView,
    error::{ExecutorError, Result},
    models::{CancelExecutionRequest, ExecutePlanRequest},
    server::AppState,
};
use cloudward_shared::{CancellationResult, ExecutionContext, ExecutionResult};

/// Execute a stored plan
///
/// Runs the full admission chain (approval token, plan freshness, kill
/// switches, execution-mode gate) and then the plan's steps to completion.
/// The response is the terminal execution result; step failures surface
/// inside it rather than as an HTTP error.
pub async fn execute_plan(
    State(state): State<AppState>,
    Json(request): Json<ExecutePlanRequest>,
) -> Result<Json<ExecutionResult>> {
    request.validate()?;

    let record = state
        .plans()
        .get(&request.plan_id)
        .ok_or_else(|| ExecutorError::PlanNotFound(request.plan_id.clone()))?;

    let context = ExecutionContext {
        user_id: request.user_id.clone(),
        customer_id: record.customer_id.clone(),
        connection_id: record.connection_id.clone(),
    };

    let result = state
        .engine()
        .execute(
            record.plan,
            request.approval_token.as_deref(),
            &context,
            None,
        )
        .await?;

    Ok(Json(result))
}

/// Stream progress events for an in-flight execution
///
/// Server-sent events, one `progress` event per engine emission. The
/// stream ends when the execution finishes and its channel closes.
pub async fn execution_events(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let receiver = state.engine().subscribe(&plan_id)?;
    info!(plan_id = %plan_id, "progress subscriber attached");

    let stream = stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(progress) => {
                    let event = match Event::default().event("progress").json_data(&progress) {
                        Ok(event) => event,
                        Err(_) => continue,
                    };
                    return Some((Ok(event), rx));
                }
                // A lagged subscriber skips ahead; the next event still
                // says where the execution stands.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Cancel an in-flight execution
///
/// Cooperative: the running execution observes the flag between steps and
/// finishes the step already in flight. Only the user who started the
/// execution may cancel it.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    Json(request): Json<CancelExecutionRequest>,
) -> Result<Json<CancellationResult>> {
    request.validate()?;

    let result = state.engine().cancel(&plan_id, &request.user_id);
    if !result.success {
        warn!(
            plan_id = %plan_id,
            user_id = %request.user_id,
            reason = ?result.reason,
            "cancellation refused"
        );
    }
    Ok(Json(result))
}

/// List in-flight executions
pub async fn list_active_executions(
    State(state): State<AppState>,
) -> Result<Json<Vec<ActiveExecutionView>>> {
    Ok(Json(state.engine().active_executions()))
}
