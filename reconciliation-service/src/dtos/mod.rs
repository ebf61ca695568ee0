//! Request and response bodies of the HTTP surface.

use crate::error::ReconciliationError;
use crate::models::{
    AuditEntry, BatchStatus, MatchResult, MatchStatus, NewRecord, ReconciliationStats,
    ResultFilter,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    /// Caller-chosen batch id; a fresh one is minted when absent.
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    pub records: Vec<NewRecord>,
}

#[derive(Debug, Serialize)]
pub struct CreateBatchResponse {
    pub batch_id: Uuid,
    pub record_count: u64,
    pub status: BatchStatus,
    /// False when the worker queue rejected the job; reconcile on demand instead.
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub batch_id: Uuid,
    pub completed: bool,
    pub stats: ReconciliationStats,
}

#[derive(Debug, Serialize)]
pub struct BatchStatsResponse {
    pub batch_id: Uuid,
    pub stats: ReconciliationStats,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultListParams {
    pub status: Option<String>,
    pub manually_reviewed: Option<bool>,
}

impl ResultListParams {
    pub fn to_filter(&self) -> Result<ResultFilter, ReconciliationError> {
        let status = self
            .status
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<MatchStatus>)
            .transpose()?;

        Ok(ResultFilter {
            status,
            manually_reviewed: self.manually_reviewed,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ResultListResponse {
    pub batch_id: Uuid,
    pub total: usize,
    pub results: Vec<MatchResult>,
}

#[derive(Debug, Deserialize)]
pub struct AggregateStatsRequest {
    pub batch_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AggregateStatsResponse {
    pub batch_count: usize,
    pub stats: ReconciliationStats,
}


#[derive(Debug, Serialize)]
pub struct AuditTrailResponse {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub total: usize,
    /// Newest first.
    pub entries: Vec<AuditEntry>,
}
