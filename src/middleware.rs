use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        target: "quota_throttler::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}
