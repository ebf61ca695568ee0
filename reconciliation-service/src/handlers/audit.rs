use crate::dtos::AuditTrailResponse;
use crate::services::AuditSink;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// Audit trail of one entity, newest first. Unknown entities have an empty trail.
pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let entries = state.audit.list_for_entity(&entity_type, entity_id).await?;

    Ok(Json(AuditTrailResponse {
        entity_type,
        entity_id,
        total: entries.len(),
        entries,
    }))
}
