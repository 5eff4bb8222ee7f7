//! Connection Record Handlers
//!
//! Minimal management surface for cloud connection records: deployments
//! register connections here (or substitute a real store behind the
//! `ConnectionStore` trait) so plans and executions can resolve them.

use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::info;
use validator::Validate;

use crate::{error::Result, models::UpsertConnectionRequest, server::AppState};
use cloudward_shared::Connection;

/// Create or replace a connection record
///
/// Usage counters and the creation timestamp survive replacement so an
/// update never resets a connection's execution history.
pub async fn upsert_connection(
    State(state): State<AppState>,
    Json(request): Json<UpsertConnectionRequest>,
) -> Result<Json<Connection>> {
    request.validate()?;

    let existing = state.connections().get(&request.connection_id).await.ok();
    let connection = request.into_connection(existing.as_ref());

    state.connections().upsert(connection.clone()).await?;
    info!(
        connection_id = %connection.connection_id,
        customer_id = %connection.customer_id,
        execution_mode = ?connection.execution_mode,
        "connection record upserted"
    );
    Ok(Json(connection))
}

/// Fetch a connection record
pub async fn get_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<Connection>> {
    let connection = state.connections().get(&connection_id).await?;
    Ok(Json(connection))
}
