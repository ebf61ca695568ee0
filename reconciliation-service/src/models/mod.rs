//! Domain models for reconciliation-service.

use crate::error::ReconciliationError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, order-preserving key/value payload attached to records and audit entries.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Record Models
// ============================================================================

/// A normalized transaction belonging to exactly one batch. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: Uuid,
    pub batch_id: Uuid,
    pub transaction_id: String,
    pub reference_number: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: Option<String>,
    pub source_system: Option<String>,
    pub metadata: Metadata,
    pub created_utc: DateTime<Utc>,
}

/// A parsed row handed over by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub transaction_id: String,
    #[serde(default)]
    pub reference_number: Option<String>,
    pub amount: Decimal,
    #[serde(alias = "date")]
    pub transaction_date: NaiveDate,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_system: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewRecord {
    pub fn new(transaction_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            reference_number: None,
            amount,
            transaction_date: Utc::now().date_naive(),
            description: None,
            source_system: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_reference(mut self, reference_number: impl Into<String>) -> Self {
        self.reference_number = Some(reference_number.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.transaction_date = date;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_source_system(mut self, source_system: impl Into<String>) -> Self {
        self.source_system = Some(source_system.into());
        self
    }

    /// Trim text fields and fill `reference_number` from `transaction_id` when absent.
    pub fn normalized(self) -> Result<Self, ReconciliationError> {
        let transaction_id = self.transaction_id.trim().to_string();
        if transaction_id.is_empty() {
            return Err(ReconciliationError::InvalidInput(
                "Transaction ID is required".to_string(),
            ));
        }

        let reference_number = self
            .reference_number
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| transaction_id.clone());

        Ok(Self {
            transaction_id,
            reference_number: Some(reference_number),
            description: trimmed(self.description),
            source_system: trimmed(self.source_system),
            ..self
        })
    }

    /// Materialize the row as a stored record of `batch_id`. Callers normalize first.
    pub fn into_record(self, batch_id: Uuid) -> Record {
        let reference_number = self
            .reference_number
            .unwrap_or_else(|| self.transaction_id.clone());

        Record {
            record_id: Uuid::new_v4(),
            batch_id,
            transaction_id: self.transaction_id,
            reference_number,
            amount: self.amount,
            transaction_date: self.transaction_date,
            description: self.description,
            source_system: self.source_system,
            metadata: self.metadata,
            created_utc: Utc::now(),
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Match Result Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Matched,
    Partial,
    Unmatched,
    Duplicate,
}

impl MatchStatus {
    pub const ALL: [MatchStatus; 4] = [
        MatchStatus::Matched,
        MatchStatus::Partial,
        MatchStatus::Unmatched,
        MatchStatus::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "MATCHED",
            Self::Partial => "PARTIAL",
            Self::Unmatched => "UNMATCHED",
            Self::Duplicate => "DUPLICATE",
        }
    }

    /// MATCHED and PARTIAL outcomes are linked to a counterpart record.
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Matched | Self::Partial)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MATCHED" => Ok(Self::Matched),
            "PARTIAL" => Ok(Self::Partial),
            "UNMATCHED" => Ok(Self::Unmatched),
            "DUPLICATE" => Ok(Self::Duplicate),
            other => Err(ReconciliationError::InvalidInput(format!(
                "Invalid reconciliation status: {}",
                other
            ))),
        }
    }
}

/// The stored reconciliation outcome of exactly one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub result_id: Uuid,
    pub record_id: Uuid,
    pub batch_id: Uuid,
    pub status: MatchStatus,
    pub matched_with: Option<Uuid>,
    pub confidence: f64,
    pub rule_name: String,
    pub reason: String,
    pub amount_variance: Decimal,
    pub manually_reviewed: bool,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl MatchResult {
    /// An engine-written UNMATCHED outcome nobody has reviewed yet. A later batch
    /// may still link such a record to one of its own.
    pub fn is_placeholder(&self) -> bool {
        self.status == MatchStatus::Unmatched && !self.manually_reviewed
    }
}

/// Fields of a match result as produced by a rule, before the store assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatchResult {
    pub record_id: Uuid,
    pub batch_id: Uuid,
    pub status: MatchStatus,
    pub matched_with: Option<Uuid>,
    pub confidence: f64,
    pub rule_name: String,
    pub reason: String,
    pub amount_variance: Decimal,
}

impl NewMatchResult {
    pub fn into_result(self) -> MatchResult {
        let now = Utc::now();
        MatchResult {
            result_id: Uuid::new_v4(),
            record_id: self.record_id,
            batch_id: self.batch_id,
            status: self.status,
            matched_with: self.matched_with,
            confidence: self.confidence,
            rule_name: self.rule_name,
            reason: self.reason,
            amount_variance: self.amount_variance,
            manually_reviewed: false,
            reviewed_by: None,
            reviewed_at: None,
            notes: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Outcome of writing a linked MATCHED/PARTIAL pair.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    /// Both sides were written; carries the evaluated record's result.
    Linked(MatchResult),
    /// The evaluated record was resolved concurrently; carries that result.
    AlreadyResolved(MatchResult),
    /// The counterpart holds an outcome that may not be replaced.
    CounterpartUnavailable,
}

/// Fields a reviewer may override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewUpdate {
    #[serde(default)]
    pub status: Option<MatchStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A result as it was before and after one review, read under the same lock.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewChange {
    pub before: MatchResult,
    pub after: MatchResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultFilter {
    pub status: Option<MatchStatus>,
    pub manually_reviewed: Option<bool>,
}

impl ResultFilter {
    pub fn matches(&self, result: &MatchResult) -> bool {
        self.status.map_or(true, |s| result.status == s)
            && self
                .manually_reviewed
                .map_or(true, |r| result.manually_reviewed == r)
    }
}

// ============================================================================
// Stats Models
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    pub total: u64,
    pub matched: u64,
    pub partial: u64,
    pub unmatched: u64,
    pub duplicate: u64,
}

impl ReconciliationStats {
    pub fn record(&mut self, status: MatchStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: MatchStatus, count: u64) {
        self.total += count;
        match status {
            MatchStatus::Matched => self.matched += count,
            MatchStatus::Partial => self.partial += count,
            MatchStatus::Unmatched => self.unmatched += count,
            MatchStatus::Duplicate => self.duplicate += count,
        }
    }

    pub fn merge(&mut self, other: &ReconciliationStats) {
        self.total += other.total;
        self.matched += other.matched;
        self.partial += other.partial;
        self.unmatched += other.unmatched;
        self.duplicate += other.duplicate;
    }

    pub fn is_consistent(&self) -> bool {
        self.matched + self.partial + self.unmatched + self.duplicate == self.total
    }
}

/// Result of one `reconcile_batch` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconciliationRun {
    pub stats: ReconciliationStats,
    /// False when the run stopped at a chunk boundary before the last chunk.
    pub completed: bool,
}

// ============================================================================
// Batch Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(ReconciliationError::InvalidInput(format!(
                "Invalid batch status: {}",
                other
            ))),
        }
    }
}

/// Durable processing state of one uploaded batch. A batch stays PROCESSING
/// until a run over all of its records completes or gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub uploaded_by: String,
    pub total_records: u64,
    pub processed_records: u64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Batch {
    pub fn new(batch_id: Uuid, uploaded_by: &str, total_records: u64) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            status: BatchStatus::Processing,
            uploaded_by: uploaded_by.to_string(),
            total_records,
            processed_records: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != BatchStatus::Processing
    }

    /// Apply `progress` the way the stores do.
    pub fn apply(&mut self, progress: &BatchProgress) {
        let now = Utc::now();
        self.status = progress.status;
        if let Some(processed) = progress.processed_records {
            self.processed_records = processed;
        }
        self.error_message = progress.error_message.clone();
        if progress.status == BatchStatus::Completed {
            self.completed_at = Some(now);
        }
        self.updated_utc = now;
    }
}

/// Outcome of one run, written back onto the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub status: BatchStatus,
    pub processed_records: Option<u64>,
    pub error_message: Option<String>,
}

impl BatchProgress {
    pub fn completed(processed: u64) -> Self {
        Self {
            status: BatchStatus::Completed,
            processed_records: Some(processed),
            error_message: None,
        }
    }

    /// Stopped at a chunk boundary; the batch is picked up again later.
    pub fn interrupted(processed: u64) -> Self {
        Self {
            status: BatchStatus::Processing,
            processed_records: Some(processed),
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: BatchStatus::Failed,
            processed_records: None,
            error_message: Some(error_message.into()),
        }
    }
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Reconcile,
    Review,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Reconcile => "RECONCILE",
            Self::Review => "REVIEW",
        }
    }
}

impl FromStr for AuditAction {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "RECONCILE" => Ok(Self::Reconcile),
            "REVIEW" => Ok(Self::Review),
            other => Err(ReconciliationError::InvalidInput(format!(
                "Invalid audit action: {}",
                other
            ))),
        }
    }
}

pub const MATCH_RESULT_ENTITY: &str = "MatchResult";
pub const BATCH_ENTITY: &str = "Batch";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub old_value: Option<Metadata>,
    pub new_value: Option<Metadata>,
    pub changed_by: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Old and new `{status, notes}` of a reviewed result.
    pub fn review(before: &MatchResult, after: &MatchResult, reviewer_id: &str, source: &str) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            entity_type: MATCH_RESULT_ENTITY.to_string(),
            entity_id: after.result_id,
            action: AuditAction::Review,
            old_value: Some(review_snapshot(before)),
            new_value: Some(review_snapshot(after)),
            changed_by: reviewer_id.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn reconcile(
        batch_id: Uuid,
        stats: &ReconciliationStats,
        completed: bool,
        changed_by: &str,
        source: &str,
    ) -> Self {
        let mut value = match serde_json::to_value(stats) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Metadata::new(),
        };
        value.insert("completed".to_string(), serde_json::Value::Bool(completed));

        Self {
            audit_id: Uuid::new_v4(),
            entity_type: BATCH_ENTITY.to_string(),
            entity_id: batch_id,
            action: AuditAction::Reconcile,
            old_value: None,
            new_value: Some(value),
            changed_by: changed_by.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }
}

fn review_snapshot(result: &MatchResult) -> Metadata {
    let mut snapshot = Metadata::new();
    snapshot.insert(
        "status".to_string(),
        serde_json::Value::String(result.status.as_str().to_string()),
    );
    snapshot.insert(
        "notes".to_string(),
        result
            .notes
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    );
    snapshot
}
