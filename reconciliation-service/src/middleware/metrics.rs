use crate::services::metrics::record_http_request;
use axum::extract::{MatchedPath, Request};
use axum::{middleware::Next, response::Response};
use std::time::Instant;

/// Record request count and latency, labelled by route template rather than the
/// raw path so batch and result ids do not explode label cardinality.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}
