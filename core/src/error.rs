use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response. Every error carries enough information for the
/// calling UI to understand what went wrong and how to fix it.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const FORBIDDEN: &str = "forbidden";
    pub const CONFLICT: &str = "conflict";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INTERNAL_ERROR: &str = "internal_error";

    /// Feedback pipeline failures. These travel inside a structured
    /// `{success: false, ...}` payload rather than as HTTP errors, so the
    /// client can always render a retry affordance.
    pub const AI_SERVICE_UNAVAILABLE: &str = "ai_service_unavailable";
    pub const AI_PARSE_ERROR: &str = "ai_parse_error";
}
