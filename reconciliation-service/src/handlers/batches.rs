use crate::dtos::{
    BatchStatsResponse, CreateBatchRequest, CreateBatchResponse, ReconcileResponse,
    ResultListParams, ResultListResponse,
};
use crate::engine::review::API_SOURCE;
use crate::middleware::UserId;
use crate::services::{ingest_batch, BatchStore};
use crate::startup::AppState;
use crate::workers::BatchJob;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Store a batch of normalized rows and queue it for reconciliation.
pub async fn create_batch(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<CreateBatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let batch_id = request.batch_id.unwrap_or_else(Uuid::new_v4);

    let batch = ingest_batch(state.batches.as_ref(), batch_id, &user_id.0, request.records).await?;

    let queued = match state.queue.enqueue(BatchJob::new(batch_id, user_id.0)) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(batch_id = %batch_id, error = %e, "Batch stored but not queued");
            false
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateBatchResponse {
            batch_id,
            record_count: batch.total_records,
            status: batch.status,
            queued,
        }),
    ))
}

/// Stored status and progress of a batch.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let batch = state
        .batches
        .find_batch(batch_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

    Ok(Json(batch))
}

/// Reconcile a batch synchronously.
pub async fn reconcile_batch(
    State(state): State<AppState>,
    user_id: UserId,
    Path(batch_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job = BatchJob::new(batch_id, user_id.0).with_source(API_SOURCE);
    let run = state.runner.run(&job, &CancellationToken::new()).await?;

    Ok(Json(ReconcileResponse {
        batch_id,
        completed: run.completed,
        stats: run.stats,
    }))
}

pub async fn get_batch_stats(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state.stats.stats_for_batch(batch_id).await?;
    Ok(Json(BatchStatsResponse { batch_id, stats }))
}

pub async fn list_batch_results(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Query(params): Query<ResultListParams>,
) -> Result<impl IntoResponse, AppError> {
    let filter = params.to_filter()?;
    let results = state.stats.results_for_batch(batch_id, filter).await?;

    Ok(Json(ResultListResponse {
        batch_id,
        total: results.len(),
        results,
    }))
}
