//! Storage seams consumed by the engine, the stats aggregator and the review path.

use crate::error::Result;
use crate::models::{
    AuditEntry, Batch, BatchProgress, LinkOutcome, MatchResult, MatchStatus, NewMatchResult,
    NewRecord, Record, ResultFilter, ReviewChange, ReviewUpdate,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Durable, append-only storage of normalized records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert already normalized rows for `batch_id` in one atomic write.
    async fn insert_records(&self, batch_id: Uuid, rows: Vec<NewRecord>) -> Result<Vec<Record>>;

    /// All records of a batch, in insertion order.
    async fn records_for_batch(&self, batch_id: Uuid) -> Result<Vec<Record>>;

    /// Records with the same transaction id and amount outside `exclude_batch_id`.
    async fn find_by_transaction_id_and_amount(
        &self,
        transaction_id: &str,
        amount: Decimal,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Records with the same reference number outside `exclude_batch_id`.
    async fn find_by_reference_number(
        &self,
        reference_number: &str,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Other records of `batch_id` sharing `transaction_id`.
    async fn find_duplicates_in_batch(
        &self,
        transaction_id: &str,
        batch_id: Uuid,
        exclude_record_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable storage of reconciliation outcomes, at most one per record.
#[async_trait]
pub trait MatchResultStore: Send + Sync {
    async fn find_by_record_id(&self, record_id: Uuid) -> Result<Option<MatchResult>>;

    async fn find_by_id(&self, result_id: Uuid) -> Result<Option<MatchResult>>;

    /// Fails with `Conflict` when the record already has a result.
    async fn create(&self, result: NewMatchResult) -> Result<MatchResult>;

    /// Atomically write `result` for the evaluated record and `counterpart` for the
    /// record it links to. The counterpart may replace only a placeholder outcome
    /// (see [`MatchResult::is_placeholder`]); otherwise nothing is written.
    async fn create_linked(
        &self,
        result: NewMatchResult,
        counterpart: NewMatchResult,
    ) -> Result<LinkOutcome>;

    /// Apply a review and return the result as it was right before and after.
    async fn update_review(
        &self,
        result_id: Uuid,
        reviewer_id: &str,
        update: &ReviewUpdate,
    ) -> Result<Option<ReviewChange>>;

    async fn count_by_status(&self, batch_id: Uuid) -> Result<Vec<(MatchStatus, u64)>>;

    /// Results of a batch, newest first.
    async fn list_for_batch(&self, batch_id: Uuid, filter: ResultFilter) -> Result<Vec<MatchResult>>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;

    /// Entries of one entity, newest first.
    async fn list_for_entity(&self, entity_type: &str, entity_id: Uuid) -> Result<Vec<AuditEntry>>;
}

/// Registry of uploaded batches and their processing state.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Register `batch` and store its records in one atomic write. Fails with
    /// `Conflict` when the batch id is already taken.
    async fn create_batch(&self, batch: Batch, rows: Vec<NewRecord>) -> Result<Batch>;

    async fn find_batch(&self, batch_id: Uuid) -> Result<Option<Batch>>;

    /// Mark a run as started: PROCESSING, `started_at` set once, error cleared.
    /// Unknown batch ids are ignored.
    async fn start_batch(&self, batch_id: Uuid) -> Result<()>;

    /// Unknown batch ids are ignored.
    async fn update_batch(&self, batch_id: Uuid, progress: BatchProgress) -> Result<()>;

    /// PROCESSING batches, oldest first.
    async fn unfinished_batches(&self, limit: usize) -> Result<Vec<Batch>>;
}
