//! Services module for reconciliation-service.

pub mod database;
pub mod ingest;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use ingest::ingest_batch;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use store::{AuditSink, BatchStore, MatchResultStore, RecordStore};
