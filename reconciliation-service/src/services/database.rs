//! Database service for reconciliation-service.

use crate::error::{ReconciliationError, Result};
use crate::models::{
    AuditAction, AuditEntry, Batch, BatchProgress, BatchStatus, LinkOutcome, MatchResult,
    MatchStatus, Metadata, NewMatchResult, NewRecord, Record, ResultFilter, ReviewChange,
    ReviewUpdate,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{AuditSink, BatchStore, MatchResultStore, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Rows per multi-value INSERT; keeps bind parameters well under the Postgres limit.
const INSERT_ROWS_PER_STATEMENT: usize = 1000;

const RECORD_COLUMNS: &str = "record_id, batch_id, transaction_id, reference_number, amount, transaction_date, description, source_system, metadata, created_utc";

const BATCH_COLUMNS: &str = "batch_id, status, uploaded_by, total_records, processed_records, error_message, started_at, completed_at, created_utc, updated_utc";

const AUDIT_COLUMNS: &str = "audit_id, entity_type, entity_id, action, old_value, new_value, changed_by, source, created_utc";

const RESULT_COLUMNS: &str = "result_id, record_id, batch_id, status, matched_with, confidence, rule_name, reason, amount_variance, manually_reviewed, reviewed_by, reviewed_at, notes, created_utc, updated_utc";

#[derive(Debug, FromRow)]
struct RecordRow {
    record_id: Uuid,
    batch_id: Uuid,
    transaction_id: String,
    reference_number: String,
    amount: Decimal,
    transaction_date: NaiveDate,
    description: Option<String>,
    source_system: Option<String>,
    metadata: Json<Metadata>,
    created_utc: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Self {
            record_id: row.record_id,
            batch_id: row.batch_id,
            transaction_id: row.transaction_id,
            reference_number: row.reference_number,
            amount: row.amount,
            transaction_date: row.transaction_date,
            description: row.description,
            source_system: row.source_system,
            metadata: row.metadata.0,
            created_utc: row.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct MatchResultRow {
    result_id: Uuid,
    record_id: Uuid,
    batch_id: Uuid,
    status: String,
    matched_with: Option<Uuid>,
    confidence: f64,
    rule_name: String,
    reason: String,
    amount_variance: Decimal,
    manually_reviewed: bool,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<MatchResultRow> for MatchResult {
    type Error = ReconciliationError;

    fn try_from(row: MatchResultRow) -> Result<Self> {
        let status = row.status.parse::<MatchStatus>().map_err(|e| {
            ReconciliationError::storage("Corrupt match result status", e)
        })?;

        Ok(Self {
            result_id: row.result_id,
            record_id: row.record_id,
            batch_id: row.batch_id,
            status,
            matched_with: row.matched_with,
            confidence: row.confidence,
            rule_name: row.rule_name,
            reason: row.reason,
            amount_variance: row.amount_variance,
            manually_reviewed: row.manually_reviewed,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            notes: row.notes,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    batch_id: Uuid,
    status: String,
    uploaded_by: String,
    total_records: i64,
    processed_records: i64,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = ReconciliationError;

    fn try_from(row: BatchRow) -> Result<Self> {
        let status = row
            .status
            .parse::<BatchStatus>()
            .map_err(|e| ReconciliationError::storage("Corrupt batch status", e))?;

        Ok(Self {
            batch_id: row.batch_id,
            status,
            uploaded_by: row.uploaded_by,
            total_records: row.total_records.max(0) as u64,
            processed_records: row.processed_records.max(0) as u64,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    audit_id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    action: String,
    old_value: Option<Json<Metadata>>,
    new_value: Option<Json<Metadata>>,
    changed_by: String,
    source: String,
    created_utc: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = ReconciliationError;

    fn try_from(row: AuditRow) -> Result<Self> {
        let action = row
            .action
            .parse::<AuditAction>()
            .map_err(|e| ReconciliationError::storage("Corrupt audit action", e))?;

        Ok(Self {
            audit_id: row.audit_id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            action,
            old_value: row.old_value.map(|v| v.0),
            new_value: row.new_value.map(|v| v.0),
            changed_by: row.changed_by,
            source: row.source,
            timestamp: row.created_utc,
        })
    }
}

fn into_records(rows: Vec<RecordRow>) -> Vec<Record> {
    rows.into_iter().map(Record::from).collect()
}

fn into_results(rows: Vec<MatchResultRow>) -> Result<Vec<MatchResult>> {
    rows.into_iter().map(MatchResult::try_from).collect()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_result_by_record(&self, record_id: Uuid) -> Result<Option<MatchResult>> {
        let row = sqlx::query_as::<_, MatchResultRow>(&format!(
            "SELECT {RESULT_COLUMNS} FROM match_results WHERE record_id = $1"
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to get match result", e))?;

        row.map(MatchResult::try_from).transpose()
    }

    /// Multi-value INSERTs of `records` on `conn`, split to stay under the bind limit.
    async fn insert_record_rows(conn: &mut PgConnection, records: &[Record]) -> Result<()> {
        for chunk in records.chunks(INSERT_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO records ({RECORD_COLUMNS}) "));
            builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.record_id)
                    .push_bind(record.batch_id)
                    .push_bind(record.transaction_id.clone())
                    .push_bind(record.reference_number.clone())
                    .push_bind(record.amount)
                    .push_bind(record.transaction_date)
                    .push_bind(record.description.clone())
                    .push_bind(record.source_system.clone())
                    .push_bind(Json(record.metadata.clone()))
                    .push_bind(record.created_utc);
            });

            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|e| ReconciliationError::storage("Failed to insert records", e))?;
        }
        Ok(())
    }
}

// =========================================================================
// Record Operations
// =========================================================================

#[async_trait]
impl RecordStore for Database {
    #[instrument(skip(self, rows), fields(batch_id = %batch_id, rows = rows.len()))]
    async fn insert_records(&self, batch_id: Uuid, rows: Vec<NewRecord>) -> Result<Vec<Record>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_records"])
            .start_timer();

        let records: Vec<Record> = rows.into_iter().map(|r| r.into_record(batch_id)).collect();
        if records.is_empty() {
            return Ok(records);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to begin transaction", e))?;

        Self::insert_record_rows(&mut tx, &records).await?;

        tx.commit()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to commit records", e))?;

        timer.observe_duration();
        debug!(inserted = records.len(), "Records inserted");

        Ok(records)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn records_for_batch(&self, batch_id: Uuid) -> Result<Vec<Record>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["records_for_batch"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE batch_id = $1 ORDER BY seq"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to load batch records", e))?;

        timer.observe_duration();
        Ok(into_records(rows))
    }

    #[instrument(skip(self))]
    async fn find_by_transaction_id_and_amount(
        &self,
        transaction_id: &str,
        amount: Decimal,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_transaction_id_and_amount"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM records
            WHERE transaction_id = $1 AND amount = $2 AND batch_id <> $3
            ORDER BY seq
            LIMIT $4
            "#
        ))
        .bind(transaction_id)
        .bind(amount)
        .bind(exclude_batch_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to find exact candidates", e))?;

        timer.observe_duration();
        Ok(into_records(rows))
    }

    #[instrument(skip(self))]
    async fn find_by_reference_number(
        &self,
        reference_number: &str,
        exclude_batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_reference_number"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM records
            WHERE reference_number = $1 AND batch_id <> $2
            ORDER BY seq
            LIMIT $3
            "#
        ))
        .bind(reference_number)
        .bind(exclude_batch_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to find partial candidates", e))?;

        timer.observe_duration();
        Ok(into_records(rows))
    }

    #[instrument(skip(self))]
    async fn find_duplicates_in_batch(
        &self,
        transaction_id: &str,
        batch_id: Uuid,
        exclude_record_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_duplicates_in_batch"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM records
            WHERE transaction_id = $1 AND batch_id = $2 AND record_id <> $3
            ORDER BY seq
            LIMIT $4
            "#
        ))
        .bind(transaction_id)
        .bind(batch_id)
        .bind(exclude_record_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to find duplicates", e))?;

        timer.observe_duration();
        Ok(into_records(rows))
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ReconciliationError::storage("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}

// =========================================================================
// Match Result Operations
// =========================================================================

#[async_trait]
impl MatchResultStore for Database {
    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn find_by_record_id(&self, record_id: Uuid) -> Result<Option<MatchResult>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_result_by_record"])
            .start_timer();

        let result = self.fetch_result_by_record(record_id).await?;

        timer.observe_duration();
        Ok(result)
    }

    #[instrument(skip(self), fields(result_id = %result_id))]
    async fn find_by_id(&self, result_id: Uuid) -> Result<Option<MatchResult>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_result_by_id"])
            .start_timer();

        let row = sqlx::query_as::<_, MatchResultRow>(&format!(
            "SELECT {RESULT_COLUMNS} FROM match_results WHERE result_id = $1"
        ))
        .bind(result_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to get match result", e))?;

        timer.observe_duration();
        row.map(MatchResult::try_from).transpose()
    }

    #[instrument(skip(self, result), fields(record_id = %result.record_id, status = %result.status))]
    async fn create(&self, result: NewMatchResult) -> Result<MatchResult> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_result"])
            .start_timer();

        let record_id = result.record_id;
        let row = sqlx::query_as::<_, MatchResultRow>(&format!(
            r#"
            INSERT INTO match_results (result_id, record_id, batch_id, status, matched_with, confidence, rule_name, reason, amount_variance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {RESULT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(result.record_id)
        .bind(result.batch_id)
        .bind(result.status.as_str())
        .bind(result.matched_with)
        .bind(result.confidence)
        .bind(&result.rule_name)
        .bind(&result.reason)
        .bind(result.amount_variance)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ReconciliationError::Conflict(format!(
                    "Record {} already has a match result",
                    record_id
                ))
            }
            _ => ReconciliationError::storage("Failed to create match result", e),
        })?;

        timer.observe_duration();
        row.try_into()
    }

    #[instrument(
        skip(self, result, counterpart),
        fields(record_id = %result.record_id, counterpart_id = %counterpart.record_id)
    )]
    async fn create_linked(
        &self,
        result: NewMatchResult,
        counterpart: NewMatchResult,
    ) -> Result<LinkOutcome> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_linked"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to begin transaction", e))?;

        let own = sqlx::query_as::<_, MatchResultRow>(&format!(
            r#"
            INSERT INTO match_results (result_id, record_id, batch_id, status, matched_with, confidence, rule_name, reason, amount_variance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (record_id) DO NOTHING
            RETURNING {RESULT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(result.record_id)
        .bind(result.batch_id)
        .bind(result.status.as_str())
        .bind(result.matched_with)
        .bind(result.confidence)
        .bind(&result.rule_name)
        .bind(&result.reason)
        .bind(result.amount_variance)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to create linked result", e))?;

        let Some(own) = own else {
            tx.rollback()
                .await
                .map_err(|e| ReconciliationError::storage("Failed to roll back", e))?;
            timer.observe_duration();

            return match self.fetch_result_by_record(result.record_id).await? {
                Some(existing) => Ok(LinkOutcome::AlreadyResolved(existing)),
                None => Err(ReconciliationError::storage(
                    "Conflicting match result vanished",
                    result.record_id,
                )),
            };
        };

        // Only an unreviewed UNMATCHED placeholder may be replaced.
        let upgraded: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO match_results (result_id, record_id, batch_id, status, matched_with, confidence, rule_name, reason, amount_variance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (record_id) DO UPDATE SET
                status = EXCLUDED.status,
                matched_with = EXCLUDED.matched_with,
                confidence = EXCLUDED.confidence,
                rule_name = EXCLUDED.rule_name,
                reason = EXCLUDED.reason,
                amount_variance = EXCLUDED.amount_variance,
                updated_utc = NOW()
            WHERE match_results.status = 'UNMATCHED' AND NOT match_results.manually_reviewed
            RETURNING result_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(counterpart.record_id)
        .bind(counterpart.batch_id)
        .bind(counterpart.status.as_str())
        .bind(counterpart.matched_with)
        .bind(counterpart.confidence)
        .bind(&counterpart.rule_name)
        .bind(&counterpart.reason)
        .bind(counterpart.amount_variance)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to link counterpart", e))?;

        if upgraded.is_none() {
            tx.rollback()
                .await
                .map_err(|e| ReconciliationError::storage("Failed to roll back", e))?;
            timer.observe_duration();
            return Ok(LinkOutcome::CounterpartUnavailable);
        }

        tx.commit()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to commit linked results", e))?;

        timer.observe_duration();
        Ok(LinkOutcome::Linked(own.try_into()?))
    }

    #[instrument(skip(self, update), fields(result_id = %result_id))]
    async fn update_review(
        &self,
        result_id: Uuid,
        reviewer_id: &str,
        update: &ReviewUpdate,
    ) -> Result<Option<ReviewChange>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_review"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to begin transaction", e))?;

        // The row lock keeps concurrent reviews from interleaving between read and write.
        let before = sqlx::query_as::<_, MatchResultRow>(&format!(
            "SELECT {RESULT_COLUMNS} FROM match_results WHERE result_id = $1 FOR UPDATE"
        ))
        .bind(result_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to lock match result", e))?;

        let Some(before) = before else {
            tx.rollback()
                .await
                .map_err(|e| ReconciliationError::storage("Failed to roll back", e))?;
            timer.observe_duration();
            return Ok(None);
        };

        let after = sqlx::query_as::<_, MatchResultRow>(&format!(
            r#"
            UPDATE match_results
            SET manually_reviewed = TRUE,
                reviewed_by = $2,
                reviewed_at = NOW(),
                status = COALESCE($3, status),
                notes = COALESCE($4, notes),
                updated_utc = NOW()
            WHERE result_id = $1
            RETURNING {RESULT_COLUMNS}
            "#
        ))
        .bind(result_id)
        .bind(reviewer_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.notes.as_deref())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to review match result", e))?;

        tx.commit()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to commit review", e))?;

        timer.observe_duration();
        Ok(Some(ReviewChange {
            before: before.try_into()?,
            after: after.try_into()?,
        }))
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn count_by_status(&self, batch_id: Uuid) -> Result<Vec<(MatchStatus, u64)>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_by_status"])
            .start_timer();

        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM match_results
            WHERE batch_id = $1
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to count match results", e))?;

        timer.observe_duration();

        rows.into_iter()
            .map(|(status, count)| {
                let status = status.parse::<MatchStatus>().map_err(|e| {
                    ReconciliationError::storage("Corrupt match result status", e)
                })?;
                Ok((status, count.max(0) as u64))
            })
            .collect()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn list_for_batch(&self, batch_id: Uuid, filter: ResultFilter) -> Result<Vec<MatchResult>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_for_batch"])
            .start_timer();

        let rows = sqlx::query_as::<_, MatchResultRow>(&format!(
            r#"
            SELECT {RESULT_COLUMNS} FROM match_results
            WHERE batch_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::BOOLEAN IS NULL OR manually_reviewed = $3)
            ORDER BY seq DESC
            "#
        ))
        .bind(batch_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.manually_reviewed)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to list match results", e))?;

        timer.observe_duration();
        into_results(rows)
    }
}

// =========================================================================
// Audit Operations
// =========================================================================

#[async_trait]
impl AuditSink for Database {
    #[instrument(skip(self, entry), fields(entity_type = %entry.entity_type, entity_id = %entry.entity_id, action = entry.action.as_str()))]
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_audit"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO audit_logs (audit_id, entity_type, entity_id, action, old_value, new_value, changed_by, source, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.audit_id)
        .bind(&entry.entity_type)
        .bind(entry.entity_id)
        .bind(entry.action.as_str())
        .bind(entry.old_value.map(Json))
        .bind(entry.new_value.map(Json))
        .bind(&entry.changed_by)
        .bind(&entry.source)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to write audit entry", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(entity_type = %entity_type, entity_id = %entity_id))]
    async fn list_for_entity(&self, entity_type: &str, entity_id: Uuid) -> Result<Vec<AuditEntry>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_audit"])
            .start_timer();

        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            r#"
            SELECT {AUDIT_COLUMNS} FROM audit_logs
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY seq DESC
            "#
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to list audit entries", e))?;

        timer.observe_duration();
        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}

// =========================================================================
// Batch Operations
// =========================================================================

#[async_trait]
impl BatchStore for Database {
    #[instrument(skip(self, batch, rows), fields(batch_id = %batch.batch_id, rows = rows.len()))]
    async fn create_batch(&self, batch: Batch, rows: Vec<NewRecord>) -> Result<Batch> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_batch"])
            .start_timer();

        let batch_id = batch.batch_id;
        let records: Vec<Record> = rows.into_iter().map(|r| r.into_record(batch_id)).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to begin transaction", e))?;

        // Records stored without a registration also claim the id.
        let orphaned: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM records WHERE batch_id = $1)")
                .bind(batch_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| ReconciliationError::storage("Failed to check batch records", e))?;

        let row = if orphaned {
            None
        } else {
            sqlx::query_as::<_, BatchRow>(&format!(
                r#"
                INSERT INTO batches (batch_id, status, uploaded_by, total_records, processed_records, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, 0, $5, $5)
                ON CONFLICT (batch_id) DO NOTHING
                RETURNING {BATCH_COLUMNS}
                "#
            ))
            .bind(batch_id)
            .bind(batch.status.as_str())
            .bind(&batch.uploaded_by)
            .bind(batch.total_records as i64)
            .bind(batch.created_utc)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ReconciliationError::storage("Failed to register batch", e))?
        };

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| ReconciliationError::storage("Failed to roll back", e))?;
            timer.observe_duration();
            return Err(ReconciliationError::Conflict(format!(
                "Batch {} already exists",
                batch_id
            )));
        };

        Self::insert_record_rows(&mut tx, &records).await?;

        tx.commit()
            .await
            .map_err(|e| ReconciliationError::storage("Failed to commit batch", e))?;

        timer.observe_duration();
        info!(records = records.len(), "Batch registered");
        row.try_into()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn find_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_batch"])
            .start_timer();

        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to get batch", e))?;

        timer.observe_duration();
        row.map(Batch::try_from).transpose()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn start_batch(&self, batch_id: Uuid) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["start_batch"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE batches
            SET status = 'PROCESSING',
                error_message = NULL,
                started_at = COALESCE(started_at, NOW()),
                updated_utc = NOW()
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to start batch", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, progress), fields(batch_id = %batch_id, status = %progress.status))]
    async fn update_batch(&self, batch_id: Uuid, progress: BatchProgress) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_batch"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE batches
            SET status = $2,
                processed_records = COALESCE($3, processed_records),
                error_message = $4,
                completed_at = CASE WHEN $2 = 'COMPLETED' THEN NOW() ELSE completed_at END,
                updated_utc = NOW()
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(progress.status.as_str())
        .bind(progress.processed_records.map(|n| n as i64))
        .bind(progress.error_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to update batch", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unfinished_batches(&self, limit: usize) -> Result<Vec<Batch>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unfinished_batches"])
            .start_timer();

        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            r#"
            SELECT {BATCH_COLUMNS} FROM batches
            WHERE status = 'PROCESSING'
            ORDER BY seq
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::storage("Failed to list unfinished batches", e))?;

        timer.observe_duration();
        rows.into_iter().map(Batch::try_from).collect()
    }
}
