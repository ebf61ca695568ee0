//! In-memory store for development runs and tests.

use crate::error::{ReconciliationError, Result};
use crate::models::{
    AuditEntry, Batch, BatchProgress, BatchStatus, LinkOutcome, MatchResult, MatchStatus,
    NewMatchResult, NewRecord, Record, ResultFilter, ReviewChange, ReviewUpdate,
};
use crate::services::store::{AuditSink, BatchStore, MatchResultStore, RecordStore};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    records: Vec<Record>,
    /// Insertion-ordered; `by_record` indexes into it.
    results: Vec<MatchResult>,
    by_record: HashMap<Uuid, usize>,
    audit: Vec<AuditEntry>,
    /// Registration order.
    batches: Vec<Batch>,
}

impl State {
    fn result_for(&self, record_id: Uuid) -> Option<&MatchResult> {
        self.by_record.get(&record_id).map(|&i| &self.results[i])
    }

    fn batch_mut(&mut self, batch_id: Uuid) -> Option<&mut Batch> {
        self.batches.iter_mut().find(|b| b.batch_id == batch_id)
    }

    fn insert_result(&mut self, result: MatchResult) -> MatchResult {
        self.by_record.insert(result.record_id, self.results.len());
        self.results.push(result.clone());
        result
    }
}

/// Implements every store seam over one shared state, so a single instance can
/// back the engine, the stats aggregator, the review service and the audit trail.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_results(&self) -> Vec<MatchResult> {
        self.state.read().await.results.clone()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.read().await.audit.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = State::default();
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_records(&self, batch_id: Uuid, rows: Vec<NewRecord>) -> Result<Vec<Record>> {
        let records: Vec<Record> = rows.into_iter().map(|r| r.into_record(batch_id)).collect();
        self.state.write().await.records.extend(records.iter().cloned());
        Ok(records)
    }

    async fn records_for_batch(&self, batch_id: Uuid) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn find_by_transaction_id_and_amount(
        &self,
        transaction_id: &str,
        amount: Decimal,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| {
                r.transaction_id == transaction_id
                    && r.amount == amount
                    && r.batch_id != exclude_batch_id
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_reference_number(
        &self,
        reference_number: &str,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.reference_number == reference_number && r.batch_id != exclude_batch_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_duplicates_in_batch(
        &self,
        transaction_id: &str,
        batch_id: Uuid,
        exclude_record_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| {
                r.transaction_id == transaction_id
                    && r.batch_id == batch_id
                    && r.record_id != exclude_record_id
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MatchResultStore for InMemoryStore {
    async fn find_by_record_id(&self, record_id: Uuid) -> Result<Option<MatchResult>> {
        Ok(self.state.read().await.result_for(record_id).cloned())
    }

    async fn find_by_id(&self, result_id: Uuid) -> Result<Option<MatchResult>> {
        let state = self.state.read().await;
        Ok(state
            .results
            .iter()
            .find(|r| r.result_id == result_id)
            .cloned())
    }

    async fn create(&self, result: NewMatchResult) -> Result<MatchResult> {
        let mut state = self.state.write().await;
        if state.by_record.contains_key(&result.record_id) {
            return Err(ReconciliationError::Conflict(format!(
                "Record {} already has a match result",
                result.record_id
            )));
        }
        Ok(state.insert_result(result.into_result()))
    }

    async fn create_linked(
        &self,
        result: NewMatchResult,
        counterpart: NewMatchResult,
    ) -> Result<LinkOutcome> {
        // One write guard covers both sides.
        let mut state = self.state.write().await;

        if let Some(existing) = state.result_for(result.record_id) {
            return Ok(LinkOutcome::AlreadyResolved(existing.clone()));
        }

        match state.by_record.get(&counterpart.record_id).copied() {
            Some(index) => {
                let existing = &mut state.results[index];
                if !existing.is_placeholder() {
                    return Ok(LinkOutcome::CounterpartUnavailable);
                }
                existing.status = counterpart.status;
                existing.matched_with = counterpart.matched_with;
                existing.confidence = counterpart.confidence;
                existing.rule_name = counterpart.rule_name;
                existing.reason = counterpart.reason;
                existing.amount_variance = counterpart.amount_variance;
                existing.updated_utc = Utc::now();
            }
            None => {
                state.insert_result(counterpart.into_result());
            }
        }

        Ok(LinkOutcome::Linked(state.insert_result(result.into_result())))
    }

    async fn update_review(
        &self,
        result_id: Uuid,
        reviewer_id: &str,
        update: &ReviewUpdate,
    ) -> Result<Option<ReviewChange>> {
        let mut state = self.state.write().await;
        let Some(result) = state.results.iter_mut().find(|r| r.result_id == result_id) else {
            return Ok(None);
        };
        let before = result.clone();

        let now = Utc::now();
        result.manually_reviewed = true;
        result.reviewed_by = Some(reviewer_id.to_string());
        result.reviewed_at = Some(now);
        result.updated_utc = now;
        if let Some(status) = update.status {
            result.status = status;
        }
        if let Some(notes) = &update.notes {
            result.notes = Some(notes.clone());
        }

        Ok(Some(ReviewChange {
            before,
            after: result.clone(),
        }))
    }

    async fn count_by_status(&self, batch_id: Uuid) -> Result<Vec<(MatchStatus, u64)>> {
        let state = self.state.read().await;
        let mut counts: HashMap<MatchStatus, u64> = HashMap::new();
        for result in state.results.iter().filter(|r| r.batch_id == batch_id) {
            *counts.entry(result.status).or_default() += 1;
        }
        Ok(MatchStatus::ALL
            .iter()
            .filter_map(|s| counts.get(s).map(|&c| (*s, c)))
            .collect())
    }

    async fn list_for_batch(&self, batch_id: Uuid, filter: ResultFilter) -> Result<Vec<MatchResult>> {
        let state = self.state.read().await;
        Ok(state
            .results
            .iter()
            .rev()
            .filter(|r| r.batch_id == batch_id && filter.matches(r))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditSink for InMemoryStore {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.state.write().await.audit.push(entry);
        Ok(())
    }

    async fn list_for_entity(&self, entity_type: &str, entity_id: Uuid) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BatchStore for InMemoryStore {
    async fn create_batch(&self, batch: Batch, rows: Vec<NewRecord>) -> Result<Batch> {
        let mut state = self.state.write().await;
        let taken = state.batches.iter().any(|b| b.batch_id == batch.batch_id)
            || state.records.iter().any(|r| r.batch_id == batch.batch_id);
        if taken {
            return Err(ReconciliationError::Conflict(format!(
                "Batch {} already exists",
                batch.batch_id
            )));
        }

        let batch_id = batch.batch_id;
        state
            .records
            .extend(rows.into_iter().map(|r| r.into_record(batch_id)));
        state.batches.push(batch.clone());
        Ok(batch)
    }

    async fn find_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let state = self.state.read().await;
        Ok(state.batches.iter().find(|b| b.batch_id == batch_id).cloned())
    }

    async fn start_batch(&self, batch_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(batch) = state.batch_mut(batch_id) {
            let now = Utc::now();
            batch.status = BatchStatus::Processing;
            batch.error_message = None;
            batch.started_at.get_or_insert(now);
            batch.updated_utc = now;
        }
        Ok(())
    }

    async fn update_batch(&self, batch_id: Uuid, progress: BatchProgress) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(batch) = state.batch_mut(batch_id) {
            batch.apply(&progress);
        }
        Ok(())
    }

    async fn unfinished_batches(&self, limit: usize) -> Result<Vec<Batch>> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .iter()
            .filter(|b| !b.is_finished())
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::rules::{EXACT_MATCH, UNMATCHED_RULE};

    fn outcome(record_id: Uuid, batch_id: Uuid, status: MatchStatus, with: Option<Uuid>) -> NewMatchResult {
        NewMatchResult {
            record_id,
            batch_id,
            status,
            matched_with: with,
            confidence: 1.0,
            rule_name: (if with.is_some() { EXACT_MATCH } else { UNMATCHED_RULE }).to_string(),
            reason: "test".to_string(),
            amount_variance: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn create_rejects_second_result_for_record() {
        let store = InMemoryStore::new();
        let (record, batch) = (Uuid::new_v4(), Uuid::new_v4());

        store
            .create(outcome(record, batch, MatchStatus::Unmatched, None))
            .await
            .unwrap();
        let err = store
            .create(outcome(record, batch, MatchStatus::Duplicate, None))
            .await
            .unwrap_err();

        assert!(matches!(err, ReconciliationError::Conflict(_)));
        assert_eq!(store.all_results().await.len(), 1);
    }

    #[tokio::test]
    async fn create_linked_upgrades_placeholder_in_place() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (batch_a, batch_b) = (Uuid::new_v4(), Uuid::new_v4());

        let placeholder = store
            .create(outcome(b, batch_b, MatchStatus::Unmatched, None))
            .await
            .unwrap();

        let linked = store
            .create_linked(
                outcome(a, batch_a, MatchStatus::Matched, Some(b)),
                outcome(b, batch_b, MatchStatus::Matched, Some(a)),
            )
            .await
            .unwrap();
        assert!(matches!(linked, LinkOutcome::Linked(ref r) if r.record_id == a));

        let upgraded = store.find_by_record_id(b).await.unwrap().unwrap();
        assert_eq!(upgraded.result_id, placeholder.result_id);
        assert_eq!(upgraded.status, MatchStatus::Matched);
        assert_eq!(upgraded.matched_with, Some(a));
    }

    #[tokio::test]
    async fn review_returns_state_before_and_after() {
        let store = InMemoryStore::new();
        let created = store
            .create(outcome(Uuid::new_v4(), Uuid::new_v4(), MatchStatus::Unmatched, None))
            .await
            .unwrap();

        let update = ReviewUpdate {
            status: Some(MatchStatus::Matched),
            notes: Some("first pass".to_string()),
        };
        let first = store
            .update_review(created.result_id, "reviewer-1", &update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.before.status, MatchStatus::Unmatched);
        assert_eq!(first.after.status, MatchStatus::Matched);

        let notes_only = ReviewUpdate {
            status: None,
            notes: Some("second pass".to_string()),
        };
        let second = store
            .update_review(created.result_id, "reviewer-2", &notes_only)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.before, first.after);
        assert_eq!(second.after.notes.as_deref(), Some("second pass"));
    }

    #[tokio::test]
    async fn batch_ids_cannot_be_reused() {
        let store = InMemoryStore::new();
        let batch_id = Uuid::new_v4();
        let rows = vec![NewRecord::new("T1", Decimal::ONE)];

        store
            .create_batch(Batch::new(batch_id, "uploader-1", 1), rows.clone())
            .await
            .unwrap();
        let err = store
            .create_batch(Batch::new(batch_id, "uploader-2", 1), rows.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::Conflict(_)));
        assert_eq!(store.records_for_batch(batch_id).await.unwrap().len(), 1);

        // Records stored without a registration also claim the id.
        let seeded = Uuid::new_v4();
        store.insert_records(seeded, rows.clone()).await.unwrap();
        let err = store
            .create_batch(Batch::new(seeded, "uploader-1", 1), rows)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_linked_leaves_reviewed_counterpart_alone() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (batch_a, batch_b) = (Uuid::new_v4(), Uuid::new_v4());

        let reviewed = store
            .create(outcome(b, batch_b, MatchStatus::Unmatched, None))
            .await
            .unwrap();
        store
            .update_review(reviewed.result_id, "reviewer", &ReviewUpdate::default())
            .await
            .unwrap();

        let linked = store
            .create_linked(
                outcome(a, batch_a, MatchStatus::Matched, Some(b)),
                outcome(b, batch_b, MatchStatus::Matched, Some(a)),
            )
            .await
            .unwrap();

        assert_eq!(linked, LinkOutcome::CounterpartUnavailable);
        assert!(store.find_by_record_id(a).await.unwrap().is_none());
    }
}
