use crate::dtos::{AggregateStatsRequest, AggregateStatsResponse};
use crate::middleware::UserId;
use crate::models::ReviewUpdate;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

pub async fn get_result(
    State(state): State<AppState>,
    Path(result_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let result = state
        .stats
        .result(result_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Match result {} not found", result_id)))?;

    Ok(Json(result))
}

/// Manual review of one result.
pub async fn review_result(
    State(state): State<AppState>,
    user_id: UserId,
    Path(result_id): Path<Uuid>,
    Json(update): Json<ReviewUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let result = state
        .review
        .review_result(result_id, &user_id.0, update)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Match result {} not found", result_id)))?;

    Ok(Json(result))
}

/// Stats summed over several batches.
pub async fn aggregate_stats(
    State(state): State<AppState>,
    Json(request): Json<AggregateStatsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state.stats.stats_for_batches(&request.batch_ids).await?;

    Ok(Json(AggregateStatsResponse {
        batch_count: request.batch_ids.len(),
        stats,
    }))
}
