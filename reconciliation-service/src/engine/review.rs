//! Manual review: the only path that mutates a stored result.

use crate::error::{ReconciliationError, Result};
use crate::models::{AuditEntry, MatchResult, ReviewChange, ReviewUpdate};
use crate::services::metrics;
use crate::services::store::{AuditSink, MatchResultStore};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Audit source recorded for reviews coming through the HTTP surface.
pub const API_SOURCE: &str = "API";

#[derive(Clone)]
pub struct ReviewService {
    results: Arc<dyn MatchResultStore>,
    audit: Arc<dyn AuditSink>,
}

impl ReviewService {
    pub fn new(results: Arc<dyn MatchResultStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { results, audit }
    }

    /// Apply a reviewer's override. Returns `None` when the result does not exist.
    /// An audit write failure is reported to the caller; the review stays applied.
    #[instrument(skip(self, update), fields(result_id = %result_id, reviewer_id = %reviewer_id))]
    pub async fn review_result(
        &self,
        result_id: Uuid,
        reviewer_id: &str,
        update: ReviewUpdate,
    ) -> Result<Option<MatchResult>> {
        let reviewer_id = reviewer_id.trim();
        if reviewer_id.is_empty() {
            return Err(ReconciliationError::InvalidInput(
                "Reviewer ID is required".to_string(),
            ));
        }

        let Some(ReviewChange { before, after }) = self
            .results
            .update_review(result_id, reviewer_id, &update)
            .await?
        else {
            return Ok(None);
        };

        let entry = AuditEntry::review(&before, &after, reviewer_id, API_SOURCE);
        if let Err(e) = self.audit.record(entry).await {
            metrics::record_error("audit");
            warn!(error = %e, "Failed to write review audit entry");
            return Err(e);
        }

        metrics::record_review(after.status.as_str());
        info!(
            old_status = %before.status,
            new_status = %after.status,
            "Match result reviewed"
        );

        Ok(Some(after))
    }
}
