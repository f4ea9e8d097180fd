use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Storage probe result: "up" or "down". Flags, sessions, and the
    /// reconcile scheduler all depend on it.
    pub database: String,
    pub version: String,
}

/// Storage is the only hard dependency; the AI provider is probed lazily
/// per request and its outages surface as structured pipeline failures,
/// not as unhealth.
fn resolve_health(db_ok: bool) -> (StatusCode, HealthResponse) {
    let (http_status, status, database) = if db_ok {
        (StatusCode::OK, "ok", "up")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable", "down")
    };

    (
        http_status,
        HealthResponse {
            status: status.to_string(),
            database: database.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Storage is unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let (http_status, body) = resolve_health(db_ok);
    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::resolve_health;

    #[test]
    fn healthy_when_storage_answers() {
        let (status, body) = resolve_health(true);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
        assert_eq!(body.database, "up");
    }

    #[test]
    fn unavailable_when_storage_is_down() {
        let (status, body) = resolve_health(false);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unavailable");
        assert_eq!(body.database, "down");
    }
}
