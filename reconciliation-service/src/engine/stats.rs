//! Read-side rollups over stored match results.

use crate::error::Result;
use crate::models::{MatchResult, ReconciliationStats, ResultFilter};
use crate::services::store::MatchResultStore;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct StatsAggregator {
    results: Arc<dyn MatchResultStore>,
}

impl StatsAggregator {
    pub fn new(results: Arc<dyn MatchResultStore>) -> Self {
        Self { results }
    }

    /// Counts of the batch's stored results by status. Reflects manual review
    /// overrides, unlike the totals a run returns.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn stats_for_batch(&self, batch_id: Uuid) -> Result<ReconciliationStats> {
        let mut stats = ReconciliationStats::default();
        for (status, count) in self.results.count_by_status(batch_id).await? {
            stats.add(status, count);
        }
        Ok(stats)
    }

    /// Sum of the per-batch stats. Unknown batches contribute zeros.
    #[instrument(skip(self, batch_ids), fields(batches = batch_ids.len()))]
    pub async fn stats_for_batches(&self, batch_ids: &[Uuid]) -> Result<ReconciliationStats> {
        let mut total = ReconciliationStats::default();
        for batch_id in batch_ids {
            total.merge(&self.stats_for_batch(*batch_id).await?);
        }
        Ok(total)
    }

    /// Results of a batch, newest first.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn results_for_batch(
        &self,
        batch_id: Uuid,
        filter: ResultFilter,
    ) -> Result<Vec<MatchResult>> {
        self.results.list_for_batch(batch_id, filter).await
    }
    #[instrument(skip(self), fields(result_id = %result_id))]
    pub async fn result(&self, result_id: Uuid) -> Result<Option<MatchResult>> {
        self.results.find_by_id(result_id).await
    }
}
