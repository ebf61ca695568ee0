pub mod audit;
pub mod batches;
pub mod health;
pub mod results;

pub use audit::get_audit_trail;
pub use batches::{create_batch, get_batch, get_batch_stats, list_batch_results, reconcile_batch};
pub use health::{health_check, metrics_handler, readiness_check};
pub use results::{aggregate_stats, get_result, review_result};
