//! Integration tests for batch reconciliation over the in-memory store.

mod common;

use common::{
    amount, assert_symmetric, engine, engine_with, ingest, init_tracing, result_for, row,
    status_of,
};
use reconciliation_service::engine::rules::{
    DUPLICATE_DETECTION, EXACT_MATCH, PARTIAL_MATCH, UNMATCHED_RULE,
};
use reconciliation_service::engine::RuleRegistry;
use reconciliation_service::models::{MatchStatus, ReconciliationStats, ReviewUpdate};
use reconciliation_service::services::{InMemoryStore, MatchResultStore};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test]
async fn exact_match_links_new_record_to_earlier_unmatched_one() {
    init_tracing();
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    let earlier = ingest(&store, first_batch, vec![row("T1", "100.00")]).await;
    let stats = engine.reconcile_batch(first_batch).await.unwrap();
    assert_eq!(stats.unmatched, 1);
    let placeholder = result_for(&store, &earlier[0]).await;

    let later = ingest(&store, second_batch, vec![row("T1", "100.00")]).await;
    let stats = engine.reconcile_batch(second_batch).await.unwrap();

    assert_eq!(
        stats,
        ReconciliationStats {
            total: 1,
            matched: 1,
            ..Default::default()
        }
    );

    let new_result = result_for(&store, &later[0]).await;
    assert_eq!(new_result.status, MatchStatus::Matched);
    assert_eq!(new_result.matched_with, Some(earlier[0].record_id));
    assert_eq!(new_result.rule_name, EXACT_MATCH);
    assert_eq!(new_result.reason, "Exact match on transaction ID and amount");
    assert_eq!(new_result.confidence, 1.0);

    let upgraded = result_for(&store, &earlier[0]).await;
    assert_eq!(upgraded.result_id, placeholder.result_id);
    assert_eq!(upgraded.status, MatchStatus::Matched);
    assert_eq!(upgraded.matched_with, Some(later[0].record_id));

    assert_eq!(store.all_results().await.len(), 2);
    assert_symmetric(&store.all_results().await);
}

#[tokio::test]
async fn partial_match_within_tolerance() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    let earlier = ingest(
        &store,
        first_batch,
        vec![row("BANK-1", "1000.00").with_reference("REF-42")],
    )
    .await;
    let later = ingest(
        &store,
        second_batch,
        vec![row("LEDGER-1", "1015.00").with_reference("REF-42")],
    )
    .await;

    let stats = engine.reconcile_batch(second_batch).await.unwrap();
    assert_eq!(stats.partial, 1);

    let result = result_for(&store, &later[0]).await;
    assert_eq!(result.status, MatchStatus::Partial);
    assert_eq!(result.rule_name, PARTIAL_MATCH);
    assert_eq!(result.matched_with, Some(earlier[0].record_id));
    assert_eq!(result.amount_variance, amount("15.00"));
    assert_eq!(
        result.reason,
        "Partial match on reference number with amount variance of 1.48%"
    );
    assert!(result.confidence > 0.985 && result.confidence < 0.986);

    let counterpart = result_for(&store, &earlier[0]).await;
    assert_eq!(counterpart.status, MatchStatus::Partial);
    assert_eq!(counterpart.amount_variance, amount("15.00"));
    assert_symmetric(&store.all_results().await);
}

#[tokio::test]
async fn partial_match_rejects_variance_above_tolerance() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    let earlier = ingest(
        &store,
        first_batch,
        vec![row("BANK-1", "1000.00").with_reference("REF-42")],
    )
    .await;
    let later = ingest(
        &store,
        second_batch,
        vec![row("LEDGER-1", "1030.00").with_reference("REF-42")],
    )
    .await;

    engine.reconcile_batch(second_batch).await.unwrap();

    let result = result_for(&store, &later[0]).await;
    assert_eq!(result.status, MatchStatus::Unmatched);
    assert_eq!(result.rule_name, UNMATCHED_RULE);
    assert_eq!(result.reason, "No matching record found");
    assert!(store
        .find_by_record_id(earlier[0].record_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn partial_match_handles_debits() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    ingest(
        &store,
        first_batch,
        vec![row("BANK-7", "-100.00").with_reference("REF-7")],
    )
    .await;
    let later = ingest(
        &store,
        second_batch,
        vec![row("LEDGER-7", "-101.00").with_reference("REF-7")],
    )
    .await;

    engine.reconcile_batch(second_batch).await.unwrap();

    let result = result_for(&store, &later[0]).await;
    assert_eq!(result.status, MatchStatus::Partial);
    assert_eq!(result.amount_variance, amount("1.00"));
    assert!((0.0..=1.0).contains(&result.confidence));
}

#[tokio::test]
async fn within_batch_duplicates_are_flagged() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let batch = Uuid::new_v4();
    let records = ingest(
        &store,
        batch,
        vec![row("T1", "10.00"), row("T1", "10.00"), row("T2", "20.00")],
    )
    .await;

    let stats = engine.reconcile_batch(batch).await.unwrap();
    assert_eq!(
        stats,
        ReconciliationStats {
            total: 3,
            duplicate: 2,
            unmatched: 1,
            ..Default::default()
        }
    );

    for record in &records[..2] {
        let result = result_for(&store, record).await;
        assert_eq!(result.status, MatchStatus::Duplicate);
        assert_eq!(result.rule_name, DUPLICATE_DETECTION);
        assert_eq!(result.matched_with, None);
        assert_eq!(
            result.reason,
            "Duplicate transaction ID found 1 time(s) in the same upload"
        );
    }
    assert_eq!(status_of(&store, &records[2]).await, MatchStatus::Unmatched);
}

#[tokio::test]
async fn exact_match_takes_precedence_over_duplicate_detection() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    let earlier = ingest(&store, first_batch, vec![row("T9", "50.00")]).await;
    let later = ingest(
        &store,
        second_batch,
        vec![row("T9", "50.00"), row("T9", "50.00")],
    )
    .await;

    let stats = engine.reconcile_batch(second_batch).await.unwrap();
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.duplicate, 1);

    let first = result_for(&store, &later[0]).await;
    assert_eq!(first.status, MatchStatus::Matched);
    assert_eq!(first.matched_with, Some(earlier[0].record_id));

    // The only counterpart is taken, so the second copy falls through to duplicates.
    let second = result_for(&store, &later[1]).await;
    assert_eq!(second.status, MatchStatus::Duplicate);
    assert_symmetric(&store.all_results().await);
}

#[tokio::test]
async fn reconciling_twice_changes_nothing() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    ingest(&store, first_batch, vec![row("A", "5.00")]).await;
    ingest(
        &store,
        second_batch,
        vec![row("A", "5.00"), row("B", "6.00"), row("B", "6.00")],
    )
    .await;

    let first_run = engine.reconcile_batch(second_batch).await.unwrap();
    let before = store.all_results().await;
    let second_run = engine.reconcile_batch(second_batch).await.unwrap();
    let after = store.all_results().await;

    assert_eq!(first_run, second_run);
    assert_eq!(before, after);
    assert!(first_run.is_consistent());
}

#[tokio::test]
async fn empty_batch_yields_zero_stats() {
    let store = InMemoryStore::new();
    let stats = engine(&store).reconcile_batch(Uuid::new_v4()).await.unwrap();
    assert_eq!(stats, ReconciliationStats::default());
    assert!(store.all_results().await.is_empty());
}

#[tokio::test]
async fn chunk_size_does_not_affect_outcomes() {
    let rows = || {
        vec![
            row("X1", "10.00"),
            row("X2", "20.00").with_reference("R-2"),
            row("X3", "30.00"),
            row("X3", "30.00"),
            row("X5", "50.00"),
        ]
    };
    let prior = || vec![row("X1", "10.00"), row("Y2", "20.20").with_reference("R-2")];

    let mut outcomes = Vec::new();
    for chunk_size in [1, 2, 1000] {
        let store = InMemoryStore::new();
        let engine = engine_with(&store, RuleRegistry::default(), chunk_size);
        let batch = Uuid::new_v4();
        ingest(&store, Uuid::new_v4(), prior()).await;
        let records = ingest(&store, batch, rows()).await;

        let stats = engine.reconcile_batch(batch).await.unwrap();
        let mut statuses = Vec::new();
        for record in &records {
            statuses.push(status_of(&store, record).await);
        }
        outcomes.push((stats, statuses));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);
    assert_eq!(
        outcomes[0].1,
        vec![
            MatchStatus::Matched,
            MatchStatus::Partial,
            MatchStatus::Duplicate,
            MatchStatus::Duplicate,
            MatchStatus::Unmatched,
        ]
    );
}

#[tokio::test]
async fn cancelled_run_resumes_on_next_invocation() {
    let store = InMemoryStore::new();
    let engine = engine_with(&store, RuleRegistry::default(), 2);

    let batch = Uuid::new_v4();
    let records = ingest(
        &store,
        batch,
        (0..5).map(|i| row(&format!("C{}", i), "1.00")).collect(),
    )
    .await;

    // Resolve one record up front, as an interrupted run would have.
    engine.reconcile_record(&records[0], batch).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = engine.reconcile_batch_until(batch, &cancel).await.unwrap();
    assert!(!run.completed);
    assert_eq!(run.stats.total, 0);
    assert_eq!(store.all_results().await.len(), 1);

    let run = engine
        .reconcile_batch_until(batch, &CancellationToken::new())
        .await
        .unwrap();
    assert!(run.completed);
    assert_eq!(run.stats.total, 5);
    assert_eq!(run.stats.unmatched, 5);
    assert_eq!(store.all_results().await.len(), 5);
}

#[tokio::test]
async fn reviewed_placeholder_is_never_relinked() {
    let store = InMemoryStore::new();
    let engine = engine(&store);

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    let earlier = ingest(&store, first_batch, vec![row("T1", "100.00")]).await;
    engine.reconcile_batch(first_batch).await.unwrap();

    let placeholder = result_for(&store, &earlier[0]).await;
    store
        .update_review(
            placeholder.result_id,
            "reviewer-1",
            &ReviewUpdate {
                status: None,
                notes: Some("confirmed missing".to_string()),
            },
        )
        .await
        .unwrap();

    let later = ingest(&store, second_batch, vec![row("T1", "100.00")]).await;
    engine.reconcile_batch(second_batch).await.unwrap();

    assert_eq!(status_of(&store, &later[0]).await, MatchStatus::Unmatched);
    let kept = result_for(&store, &earlier[0]).await;
    assert_eq!(kept.status, MatchStatus::Unmatched);
    assert!(kept.manually_reviewed);
    assert_eq!(kept.matched_with, None);
}

#[tokio::test]
async fn disabled_rule_is_skipped() {
    let store = InMemoryStore::new();
    let engine = engine_with(
        &store,
        RuleRegistry::builtin(Decimal::new(2, 2)).with_disabled(&["PARTIAL_MATCH"]),
        1000,
    );

    let (first_batch, second_batch) = (Uuid::new_v4(), Uuid::new_v4());
    ingest(
        &store,
        first_batch,
        vec![row("BANK-1", "1000.00").with_reference("REF-42")],
    )
    .await;
    let later = ingest(
        &store,
        second_batch,
        vec![row("LEDGER-1", "1001.00").with_reference("REF-42")],
    )
    .await;

    engine.reconcile_batch(second_batch).await.unwrap();
    assert_eq!(status_of(&store, &later[0]).await, MatchStatus::Unmatched);
}

#[tokio::test]
async fn every_record_gets_exactly_one_result() {
    let store = InMemoryStore::new();
    let engine = engine_with(&store, RuleRegistry::default(), 3);

    let batches: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let mut all_records = Vec::new();
    for batch in &batches {
        let records = ingest(
            &store,
            *batch,
            vec![
                row("SHARED", "10.00"),
                row("NEAR", "99.00").with_reference("R-N"),
                row("DUP", "1.00"),
                row("DUP", "1.00"),
            ],
        )
        .await;
        all_records.extend(records);
        let stats = engine.reconcile_batch(*batch).await.unwrap();
        assert!(stats.is_consistent());
        assert_eq!(stats.total, 4);
    }

    let results = store.all_results().await;
    assert_eq!(results.len(), all_records.len());
    for record in &all_records {
        assert_eq!(
            results.iter().filter(|r| r.record_id == record.record_id).count(),
            1
        );
    }
    assert_symmetric(&results);
}
