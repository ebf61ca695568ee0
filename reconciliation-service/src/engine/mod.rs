//! Reconciliation engine: rule-ordered matching of one batch against every
//! previously stored record.

pub mod review;
pub mod rules;
pub mod stats;

pub use review::ReviewService;
pub use rules::{Rule, RuleRegistry};
pub use stats::StatsAggregator;

use crate::error::{ReconciliationError, Result};
use crate::models::{
    LinkOutcome, MatchResult, MatchStatus, NewMatchResult, ReconciliationRun, ReconciliationStats,
    Record,
};
use crate::services::metrics;
use crate::services::store::{MatchResultStore, RecordStore};
use rules::{DUPLICATE_DETECTION, EXACT_MATCH, PARTIAL_MATCH, UNMATCHED_RULE};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

const EXACT_SCAN_LIMIT: usize = 10;
const PARTIAL_SCAN_LIMIT: usize = 10;
const DUPLICATE_SCAN_LIMIT: usize = 5;

const EXACT_REASON: &str = "Exact match on transaction ID and amount";
const UNMATCHED_REASON: &str = "No matching record found";

/// Stateless between invocations; cheap to clone and share across workers.
#[derive(Clone)]
pub struct ReconciliationEngine {
    records: Arc<dyn RecordStore>,
    results: Arc<dyn MatchResultStore>,
    rules: Arc<RuleRegistry>,
    chunk_size: usize,
}

impl ReconciliationEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        results: Arc<dyn MatchResultStore>,
        rules: Arc<RuleRegistry>,
        chunk_size: usize,
    ) -> Self {
        Self {
            records,
            results,
            rules,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Reconcile every record of `batch_id` and return the run's totals.
    pub async fn reconcile_batch(&self, batch_id: Uuid) -> Result<ReconciliationStats> {
        let run = self
            .reconcile_batch_until(batch_id, &CancellationToken::new())
            .await?;
        Ok(run.stats)
    }

    /// Like [`reconcile_batch`](Self::reconcile_batch), but stops before the next
    /// chunk once `cancel` fires. Records already processed keep their results, so
    /// a later run picks up where this one stopped.
    #[instrument(skip(self, cancel), fields(batch_id = %batch_id, chunk_size = self.chunk_size))]
    pub async fn reconcile_batch_until(
        &self,
        batch_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationRun> {
        let started = Instant::now();

        match self.run_chunks(batch_id, cancel).await {
            Ok(run) => {
                let outcome = if run.completed { "completed" } else { "cancelled" };
                metrics::record_batch_run(outcome, started.elapsed().as_secs_f64());
                info!(
                    total = run.stats.total,
                    matched = run.stats.matched,
                    partial = run.stats.partial,
                    unmatched = run.stats.unmatched,
                    duplicate = run.stats.duplicate,
                    completed = run.completed,
                    "Batch reconciliation finished"
                );
                Ok(run)
            }
            Err(e) => {
                metrics::record_batch_run("failed", started.elapsed().as_secs_f64());
                metrics::record_error(e.kind());
                warn!(error = %e, "Batch reconciliation failed");
                Err(e)
            }
        }
    }

    async fn run_chunks(
        &self,
        batch_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationRun> {
        let records = self.records.records_for_batch(batch_id).await?;
        let mut stats = ReconciliationStats::default();

        if records.is_empty() {
            warn!("No records found for batch");
            return Ok(ReconciliationRun {
                stats,
                completed: true,
            });
        }

        info!(records = records.len(), "Starting batch reconciliation");

        for (index, chunk) in records.chunks(self.chunk_size).enumerate() {
            if cancel.is_cancelled() {
                info!(chunk = index, processed = stats.total, "Reconciliation cancelled");
                return Ok(ReconciliationRun {
                    stats,
                    completed: false,
                });
            }

            for record in chunk {
                let result = self.reconcile_record(record, batch_id).await?;
                stats.record(result.status);
            }

            debug!(chunk = index, processed = stats.total, "Chunk reconciled");
        }

        Ok(ReconciliationRun {
            stats,
            completed: true,
        })
    }

    /// Resolve one record. An existing result is returned unchanged; otherwise the
    /// first rule producing an outcome wins and UNMATCHED is the fallback.
    #[instrument(skip(self, record), fields(record_id = %record.record_id))]
    pub async fn reconcile_record(&self, record: &Record, batch_id: Uuid) -> Result<MatchResult> {
        if let Some(existing) = self.results.find_by_record_id(record.record_id).await? {
            debug!(status = %existing.status, "Record already reconciled");
            return Ok(existing);
        }

        for rule in self.rules.active_rules() {
            let outcome = match rule.name.as_str() {
                EXACT_MATCH => self.apply_exact_match(record, batch_id).await?,
                PARTIAL_MATCH => self.apply_partial_match(record, batch_id, rule).await?,
                DUPLICATE_DETECTION => self.apply_duplicate_detection(record, batch_id).await?,
                other => {
                    return Err(ReconciliationError::InvalidRule(format!(
                        "No handler registered for rule {}",
                        other
                    )))
                }
            };

            if let Some(result) = outcome {
                return Ok(result);
            }
        }

        self.create_single(NewMatchResult {
            record_id: record.record_id,
            batch_id,
            status: MatchStatus::Unmatched,
            matched_with: None,
            confidence: 0.0,
            rule_name: UNMATCHED_RULE.to_string(),
            reason: UNMATCHED_REASON.to_string(),
            amount_variance: Decimal::ZERO,
        })
        .await
    }

    async fn apply_exact_match(&self, record: &Record, batch_id: Uuid) -> Result<Option<MatchResult>> {
        let candidates = self
            .records
            .find_by_transaction_id_and_amount(
                &record.transaction_id,
                record.amount,
                batch_id,
                EXACT_SCAN_LIMIT,
            )
            .await?;

        // Only the first candidate is considered.
        let Some(candidate) = candidates.first() else {
            return Ok(None);
        };

        if !self.is_claimable(candidate.record_id).await? {
            return Ok(None);
        }

        self.link(
            record,
            batch_id,
            candidate,
            MatchStatus::Matched,
            1.0,
            EXACT_MATCH,
            EXACT_REASON.to_string(),
            Decimal::ZERO,
        )
        .await
    }

    async fn apply_partial_match(
        &self,
        record: &Record,
        batch_id: Uuid,
        rule: &Rule,
    ) -> Result<Option<MatchResult>> {
        if record.amount.is_zero() {
            return Ok(None);
        }

        let tolerance = rule
            .match_criteria
            .amount_variance
            .unwrap_or_else(rules::default_partial_variance);

        let candidates = self
            .records
            .find_by_reference_number(&record.reference_number, batch_id, PARTIAL_SCAN_LIMIT)
            .await?;

        for candidate in &candidates {
            // An overflowing difference or ratio is far outside any tolerance.
            let Some(difference) = candidate.amount.checked_sub(record.amount).map(|d| d.abs())
            else {
                continue;
            };
            let Some(ratio) = difference.checked_div(record.amount.abs()) else {
                continue;
            };
            if ratio > tolerance {
                continue;
            }

            if !self.is_claimable(candidate.record_id).await? {
                continue;
            }

            let confidence = (Decimal::ONE - ratio).to_f64().unwrap_or(0.0);
            let reason = format!(
                "Partial match on reference number with amount variance of {:.2}%",
                (ratio * Decimal::ONE_HUNDRED).round_dp(2)
            );

            if let Some(result) = self
                .link(
                    record,
                    batch_id,
                    candidate,
                    MatchStatus::Partial,
                    confidence,
                    PARTIAL_MATCH,
                    reason,
                    difference,
                )
                .await?
            {
                return Ok(Some(result));
            }
        }

        Ok(None)
    }

    async fn apply_duplicate_detection(
        &self,
        record: &Record,
        batch_id: Uuid,
    ) -> Result<Option<MatchResult>> {
        let duplicates = self
            .records
            .find_duplicates_in_batch(
                &record.transaction_id,
                batch_id,
                record.record_id,
                DUPLICATE_SCAN_LIMIT,
            )
            .await?;

        if duplicates.is_empty() {
            return Ok(None);
        }

        let result = self
            .create_single(NewMatchResult {
                record_id: record.record_id,
                batch_id,
                status: MatchStatus::Duplicate,
                matched_with: None,
                confidence: 1.0,
                rule_name: DUPLICATE_DETECTION.to_string(),
                reason: format!(
                    "Duplicate transaction ID found {} time(s) in the same upload",
                    duplicates.len()
                ),
                amount_variance: Decimal::ZERO,
            })
            .await?;

        Ok(Some(result))
    }

    /// A counterpart may be linked when it has no result yet or only an
    /// unreviewed UNMATCHED placeholder.
    async fn is_claimable(&self, record_id: Uuid) -> Result<bool> {
        Ok(self
            .results
            .find_by_record_id(record_id)
            .await?
            .map_or(true, |r| r.is_placeholder()))
    }

    /// Write the symmetric pair. `None` means the counterpart was claimed in the
    /// meantime and the caller should move on.
    #[allow(clippy::too_many_arguments)]
    async fn link(
        &self,
        record: &Record,
        batch_id: Uuid,
        counterpart: &Record,
        status: MatchStatus,
        confidence: f64,
        rule_name: &str,
        reason: String,
        amount_variance: Decimal,
    ) -> Result<Option<MatchResult>> {
        let own = NewMatchResult {
            record_id: record.record_id,
            batch_id,
            status,
            matched_with: Some(counterpart.record_id),
            confidence,
            rule_name: rule_name.to_string(),
            reason: reason.clone(),
            amount_variance,
        };
        let theirs = NewMatchResult {
            record_id: counterpart.record_id,
            batch_id: counterpart.batch_id,
            status,
            matched_with: Some(record.record_id),
            confidence,
            rule_name: rule_name.to_string(),
            reason,
            amount_variance,
        };

        match self.results.create_linked(own, theirs).await? {
            LinkOutcome::Linked(result) => {
                metrics::record_outcomes(status.as_str(), rule_name, 2);
                debug!(
                    matched_with = %counterpart.record_id,
                    status = %status,
                    rule = rule_name,
                    "Linked records"
                );
                Ok(Some(result))
            }
            LinkOutcome::AlreadyResolved(existing) => {
                debug!(status = %existing.status, "Record resolved concurrently");
                Ok(Some(existing))
            }
            LinkOutcome::CounterpartUnavailable => {
                debug!(candidate = %counterpart.record_id, "Counterpart no longer claimable");
                Ok(None)
            }
        }
    }

    /// Create a standalone result; a conflicting write means another run got
    /// there first, so its result is returned instead.
    async fn create_single(&self, result: NewMatchResult) -> Result<MatchResult> {
        let record_id = result.record_id;
        let (status, rule_name) = (result.status, result.rule_name.clone());

        match self.results.create(result).await {
            Ok(created) => {
                metrics::record_outcomes(status.as_str(), &rule_name, 1);
                Ok(created)
            }
            Err(ReconciliationError::Conflict(_)) => self
                .results
                .find_by_record_id(record_id)
                .await?
                .ok_or_else(|| {
                    ReconciliationError::storage(
                        "Conflicting match result vanished",
                        record_id,
                    )
                }),
            Err(e) => Err(e),
        }
    }
}
