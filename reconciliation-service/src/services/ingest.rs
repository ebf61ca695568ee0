//! Ingestion of normalized rows as a registered batch.

use crate::error::{ReconciliationError, Result};
use crate::models::{Batch, NewRecord};
use crate::services::store::BatchStore;
use tracing::{info, instrument};
use uuid::Uuid;

/// Normalize `rows` and register them as `batch_id` in a single store write.
/// Every row is validated first, so an invalid row leaves the store untouched.
/// A `batch_id` that is already taken fails with `Conflict`.
#[instrument(skip(store, rows), fields(batch_id = %batch_id, rows = rows.len()))]
pub async fn ingest_batch(
    store: &dyn BatchStore,
    batch_id: Uuid,
    uploaded_by: &str,
    rows: Vec<NewRecord>,
) -> Result<Batch> {
    if rows.is_empty() {
        return Err(ReconciliationError::InvalidInput(
            "Batch contains no records".to_string(),
        ));
    }

    let normalized = rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| {
            row.normalized().map_err(|e| {
                ReconciliationError::InvalidInput(format!("Row {}: {}", index + 1, e))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let batch = Batch::new(batch_id, uploaded_by, normalized.len() as u64);
    let batch = store.create_batch(batch, normalized).await?;

    info!(records = batch.total_records, "Batch ingested");
    Ok(batch)
}
