//! Common test utilities for reconciliation-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use reconciliation_service::config::{EngineConfig, WorkerConfig};
use reconciliation_service::engine::{ReconciliationEngine, RuleRegistry};
use reconciliation_service::error::{ReconciliationError, Result};
use reconciliation_service::models::{Batch, MatchResult, MatchStatus, NewRecord, Record};
use reconciliation_service::services::{
    ingest_batch, InMemoryStore, MatchResultStore, RecordStore,
};
use reconciliation_service::startup::AppState;
use reconciliation_service::workers::BatchWorker;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn amount(raw: &str) -> Decimal {
    raw.parse().expect("valid decimal literal")
}

pub fn row(transaction_id: &str, value: &str) -> NewRecord {
    NewRecord::new(transaction_id, amount(value))
}

pub fn engine(store: &InMemoryStore) -> ReconciliationEngine {
    engine_with(store, RuleRegistry::default(), 1000)
}

pub fn engine_with(
    store: &InMemoryStore,
    registry: RuleRegistry,
    chunk_size: usize,
) -> ReconciliationEngine {
    let store = Arc::new(store.clone());
    ReconciliationEngine::new(store.clone(), store, Arc::new(registry), chunk_size)
}

/// Store `rows` as `batch_id` and return the stored records in order.
pub async fn ingest(store: &InMemoryStore, batch_id: Uuid, rows: Vec<NewRecord>) -> Vec<Record> {
    let rows = rows
        .into_iter()
        .map(|r| r.normalized().expect("valid test row"))
        .collect();
    store
        .insert_records(batch_id, rows)
        .await
        .expect("insert records")
}

/// Register `rows` as a tracked batch, the way an upload does.
pub async fn register(store: &InMemoryStore, batch_id: Uuid, rows: Vec<NewRecord>) -> Batch {
    ingest_batch(store, batch_id, "uploader-1", rows)
        .await
        .expect("register batch")
}

pub async fn result_for(store: &InMemoryStore, record: &Record) -> MatchResult {
    store
        .find_by_record_id(record.record_id)
        .await
        .expect("lookup result")
        .expect("record has a result")
}

pub async fn status_of(store: &InMemoryStore, record: &Record) -> MatchStatus {
    result_for(store, record).await.status
}

pub fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        retry_attempts: 3,
        retry_delay_ms: 1,
        queue_size: 10,
    }
}

/// Application state over one in-memory store, with an unstarted worker.
pub fn test_state(store: &InMemoryStore) -> (AppState, BatchWorker) {
    init_tracing();
    let shared = Arc::new(store.clone());
    AppState::assemble(
        shared.clone(),
        shared.clone(),
        shared.clone(),
        shared,
        &EngineConfig::default(),
        &test_worker_config(),
    )
}

/// Record store whose batch loads fail with a storage error a fixed number of times.
pub struct FlakyRecords {
    pub inner: InMemoryStore,
    failures_left: AtomicU32,
    pub loads: AtomicU32,
}

impl FlakyRecords {
    pub fn new(inner: InMemoryStore, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            loads: AtomicU32::new(0),
        }
    }

    pub fn load_count(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FlakyRecords {
    async fn insert_records(&self, batch_id: Uuid, rows: Vec<NewRecord>) -> Result<Vec<Record>> {
        self.inner.insert_records(batch_id, rows).await
    }

    async fn records_for_batch(&self, batch_id: Uuid) -> Result<Vec<Record>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ReconciliationError::storage(
                "Failed to load batch records",
                "connection reset",
            ));
        }
        self.inner.records_for_batch(batch_id).await
    }

    async fn find_by_transaction_id_and_amount(
        &self,
        transaction_id: &str,
        amount: Decimal,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.inner
            .find_by_transaction_id_and_amount(transaction_id, amount, exclude_batch_id, limit)
            .await
    }

    async fn find_by_reference_number(
        &self,
        reference_number: &str,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.inner
            .find_by_reference_number(reference_number, exclude_batch_id, limit)
            .await
    }

    async fn find_duplicates_in_batch(
        &self,
        transaction_id: &str,
        batch_id: Uuid,
        exclude_record_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.inner
            .find_duplicates_in_batch(transaction_id, batch_id, exclude_record_id, limit)
            .await
    }
}

/// Every MATCHED/PARTIAL result has a counterpart pointing back with the same
/// rule, reason and confidence.
pub fn assert_symmetric(results: &[MatchResult]) {
    for result in results.iter().filter(|r| r.status.is_linked()) {
        let partner_id = result.matched_with.expect("linked result names its counterpart");
        let partner = results
            .iter()
            .find(|r| r.record_id == partner_id)
            .expect("counterpart has a result");

        assert_eq!(partner.status, result.status);
        assert_eq!(partner.matched_with, Some(result.record_id));
        assert_eq!(partner.rule_name, result.rule_name);
        assert_eq!(partner.reason, result.reason);
        assert_eq!(partner.confidence, result.confidence);
    }
}
