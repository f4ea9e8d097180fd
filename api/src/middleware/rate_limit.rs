use axum::http::Response;
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

type RateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, axum::body::Body>;

/// Rate limit for POST /v1/sessions/{id}/feedback: 10 requests/minute per IP.
/// Each request may fan out to the AI provider, so this stays tight.
pub fn feedback_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(6)
            .burst_size(10)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for feedback"),
    )
    .error_handler(json_error_handler)
}

/// Rate limit for flag writes: 60 requests/minute per IP.
pub fn flags_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(1)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for flags"),
    )
    .error_handler(json_error_handler)
}

/// Rate limit for session reads and writes: 120 requests/minute per IP.
pub fn sessions_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_millisecond(500)
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for sessions"),
    )
    .error_handler(json_error_handler)
}

/// Rate limit for POST /v1/admin/reconcile: 2 requests/minute per IP. A
/// pass scans the whole flag table, so manual triggers stay rare.
pub fn admin_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(30)
            .burst_size(2)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for admin"),
    )
    .error_handler(json_error_handler)
}

/// Custom error handler that returns JSON in ApiError format with Retry-After header.
fn json_error_handler(err: GovernorError) -> Response<axum::body::Body> {
    let (status, retry_after, message) = match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            wait_time.to_string(),
            format!("Too many requests. Retry after {wait_time} seconds."),
        ),
        GovernorError::UnableToExtractKey => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            String::new(),
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => {
            (code, String::new(), msg.unwrap_or_default().to_string())
        }
    };

    let request_id = uuid::Uuid::now_v7().to_string();
    let body = serde_json::json!({
        "error": essaylab_core::error::codes::RATE_LIMITED,
        "message": message,
        "request_id": request_id,
    });

    let mut response = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();

    if !retry_after.is_empty() {
        response
            .headers_mut()
            .insert("retry-after", retry_after.parse().unwrap());
    }

    response
}
