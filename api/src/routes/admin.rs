use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;

use essaylab_core::error::ApiError;

use crate::error::AppError;
use crate::reconcile::{self, ReconcileStats};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/admin/reconcile", post(trigger_reconcile))
}

/// Run a flag reconciliation pass now
///
/// Same pass the background scheduler runs on its interval; safe to trigger
/// at any time because the pass is idempotent.
#[utoipa::path(
    post,
    path = "/v1/admin/reconcile",
    responses(
        (status = 200, description = "Pass completed", body = ReconcileStats),
        (status = 500, description = "Scan failed", body = ApiError)
    ),
    tag = "admin"
)]
pub async fn trigger_reconcile(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let stats = reconcile::run(&state.db).await?;
    tracing::info!(
        groups = stats.groups,
        updated = stats.updated,
        inserted = stats.inserted,
        "manual reconciliation pass complete"
    );
    Ok(axum::Json(stats))
}
