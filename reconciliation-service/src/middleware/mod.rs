pub mod metrics;
pub mod user_id;

pub use metrics::metrics_middleware;
pub use user_id::{UserId, USER_ID_HEADER};
