use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use essaylab_core::error::ApiError;
use essaylab_core::feedback::DEFAULT_LEVELS_TOTAL;
use essaylab_core::progress::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PASS_THRESHOLD, ExhaustionPolicy, LevelPolicy, LevelProgress,
    LevelState, SessionState, level_unlocked, session_state,
};

use crate::error::AppError;
use crate::routes::extract_user_id;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/progress", get(get_progress))
}

/// One essay-revision session, created per quiz attempt. The leveling policy
/// is captured at creation time so later quiz edits never change the rules
/// mid-session.
#[derive(Debug, Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct Session {
    pub id: Uuid,
    pub user_id: i64,
    pub attempt_id: i64,
    pub quiz_id: i64,
    pub levels_total: i32,
    pub pass_threshold: f64,
    pub max_attempts: i32,
    pub advance_on_exhaustion: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn policy(&self) -> LevelPolicy {
        LevelPolicy {
            levels_total: self.levels_total,
            pass_threshold: self.pass_threshold,
            max_attempts: self.max_attempts,
            exhaustion: if self.advance_on_exhaustion {
                ExhaustionPolicy::AdvanceWithWarning
            } else {
                ExhaustionPolicy::HardBlock
            },
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateSessionRequest {
    pub attempt_id: i64,
    pub quiz_id: i64,
    pub levels_total: Option<i32>,
    pub pass_threshold: Option<f64>,
    pub max_attempts: Option<i32>,
    pub advance_on_exhaustion: Option<bool>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LevelProgressItem {
    pub level: i32,
    pub attempts_used: i32,
    pub best_score: f64,
    pub state: LevelState,
    /// Whether a feedback request may target this level right now
    pub unlocked: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProgressResponse {
    pub session_id: Uuid,
    pub session_state: SessionState,
    pub levels: Vec<LevelProgressItem>,
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    level: i32,
    attempts_used: i32,
    best_score: f64,
    state: String,
}

impl ProgressRow {
    fn into_progress(self) -> Result<LevelProgress, AppError> {
        let state = LevelState::parse(&self.state).ok_or_else(|| {
            AppError::Internal(format!("unknown level state in storage: {}", self.state))
        })?;
        Ok(LevelProgress {
            level: self.level,
            attempts_used: self.attempts_used,
            best_score: self.best_score,
            state,
        })
    }
}

pub(crate) async fn load_session(
    pool: &sqlx::PgPool,
    session_id: Uuid,
) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, user_id, attempt_id, quiz_id, levels_total, pass_threshold, max_attempts, \
         advance_on_exhaustion, status, created_at \
         FROM essay_sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn load_progress(
    pool: &sqlx::PgPool,
    session_id: Uuid,
) -> Result<Vec<LevelProgress>, AppError> {
    let rows: Vec<ProgressRow> = sqlx::query_as(
        "SELECT level, attempts_used, best_score, state \
         FROM essay_progress WHERE session_id = $1 ORDER BY level ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ProgressRow::into_progress).collect()
}

/// Fetch a session and enforce that the caller owns it.
pub(crate) async fn load_owned_session(
    pool: &sqlx::PgPool,
    session_id: Uuid,
    user_id: i64,
) -> Result<Session, AppError> {
    let session = load_session(pool, session_id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource: "session".to_string(),
        })?;

    if session.user_id != user_id {
        return Err(AppError::Forbidden {
            message: "Session belongs to another user".to_string(),
            docs_hint: None,
        });
    }

    Ok(session)
}

fn validate_policy_overrides(req: &CreateSessionRequest) -> Result<(), AppError> {
    if req.attempt_id <= 0 || req.quiz_id <= 0 {
        return Err(AppError::Validation {
            message: "attempt_id and quiz_id must be positive integers".to_string(),
            field: Some("attempt_id".to_string()),
            received: Some(serde_json::json!({
                "attempt_id": req.attempt_id,
                "quiz_id": req.quiz_id,
            })),
            docs_hint: None,
        });
    }

    if let Some(levels_total) = req.levels_total {
        if !(1..=10).contains(&levels_total) {
            return Err(AppError::Validation {
                message: "levels_total must be between 1 and 10".to_string(),
                field: Some("levels_total".to_string()),
                received: Some(serde_json::json!(levels_total)),
                docs_hint: None,
            });
        }
    }

    if let Some(pass_threshold) = req.pass_threshold {
        if !(0.0..=100.0).contains(&pass_threshold) {
            return Err(AppError::Validation {
                message: "pass_threshold must be between 0 and 100".to_string(),
                field: Some("pass_threshold".to_string()),
                received: Some(serde_json::json!(pass_threshold)),
                docs_hint: None,
            });
        }
    }

    if let Some(max_attempts) = req.max_attempts {
        if !(1..=20).contains(&max_attempts) {
            return Err(AppError::Validation {
                message: "max_attempts must be between 1 and 20".to_string(),
                field: Some("max_attempts".to_string()),
                received: Some(serde_json::json!(max_attempts)),
                docs_hint: None,
            });
        }
    }

    Ok(())
}

/// Create a session
///
/// One session exists per (user, attempt); a repeat POST for the same
/// attempt returns the existing session instead of erroring, so platform
/// retries are safe.
#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = Session),
        (status = 200, description = "Session already existed", body = Session),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    params(
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_policy_overrides(&req)?;

    let session_id = Uuid::now_v7();
    let levels_total = req.levels_total.unwrap_or(DEFAULT_LEVELS_TOTAL);
    let pass_threshold = req.pass_threshold.unwrap_or(DEFAULT_PASS_THRESHOLD);
    let max_attempts = req.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    let advance_on_exhaustion = req.advance_on_exhaustion.unwrap_or(false);

    let inserted: Option<Session> = sqlx::query_as(
        r#"
        INSERT INTO essay_sessions
            (id, user_id, attempt_id, quiz_id, levels_total, pass_threshold,
             max_attempts, advance_on_exhaustion, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'not_started', $9)
        ON CONFLICT (user_id, attempt_id) DO NOTHING
        RETURNING id, user_id, attempt_id, quiz_id, levels_total, pass_threshold,
                  max_attempts, advance_on_exhaustion, status, created_at
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .bind(req.attempt_id)
    .bind(req.quiz_id)
    .bind(levels_total)
    .bind(pass_threshold)
    .bind(max_attempts)
    .bind(advance_on_exhaustion)
    .bind(Utc::now())
    .fetch_optional(&state.db)
    .await?;

    match inserted {
        Some(session) => {
            tracing::info!(user_id, attempt_id = req.attempt_id, session_id = %session.id, "session created");
            Ok((StatusCode::CREATED, Json(session)))
        }
        None => {
            let existing: Session = sqlx::query_as(
                "SELECT id, user_id, attempt_id, quiz_id, levels_total, pass_threshold, \
                 max_attempts, advance_on_exhaustion, status, created_at \
                 FROM essay_sessions WHERE user_id = $1 AND attempt_id = $2",
            )
            .bind(user_id)
            .bind(req.attempt_id)
            .fetch_one(&state.db)
            .await?;
            Ok((StatusCode::OK, Json(existing)))
        }
    }
}

/// Fetch a session
#[utoipa::path(
    get,
    path = "/v1/sessions/{id}",
    responses(
        (status = 200, description = "Session", body = Session),
        (status = 403, description = "Owned by another user", body = ApiError),
        (status = 404, description = "No such session", body = ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Session id"),
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    let session = load_owned_session(&state.db, session_id, user_id).await?;
    Ok(Json(session))
}

/// Fetch per-level progress
///
/// Reports every level of the session's policy, including untouched ones,
/// with the derived overall session state.
#[utoipa::path(
    get,
    path = "/v1/sessions/{id}/progress",
    responses(
        (status = 200, description = "Per-level progress", body = ProgressResponse),
        (status = 403, description = "Owned by another user", body = ApiError),
        (status = 404, description = "No such session", body = ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Session id"),
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "sessions"
)]
pub async fn get_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    let session = load_owned_session(&state.db, session_id, user_id).await?;
    let policy = session.policy();
    let progress = load_progress(&state.db, session_id).await?;

    let levels = (1..=policy.levels_total)
        .map(|level| {
            let entered = progress.iter().find(|item| item.level == level);
            LevelProgressItem {
                level,
                attempts_used: entered.map_or(0, |item| item.attempts_used),
                best_score: entered.map_or(0.0, |item| item.best_score),
                state: entered.map_or(LevelState::Locked, |item| item.state),
                unlocked: level_unlocked(level, &progress, &policy),
            }
        })
        .collect();

    Ok(Json(ProgressResponse {
        session_id,
        session_state: session_state(&progress, &policy),
        levels,
    }))
}

#[cfg(test)]
mod tests {
    use super::{CreateSessionRequest, validate_policy_overrides};

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            attempt_id: 10,
            quiz_id: 4,
            levels_total: None,
            pass_threshold: None,
            max_attempts: None,
            advance_on_exhaustion: None,
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(validate_policy_overrides(&request()).is_ok());
    }

    #[test]
    fn ids_must_be_positive() {
        let mut req = request();
        req.attempt_id = 0;
        assert!(validate_policy_overrides(&req).is_err());
    }

    #[test]
    fn policy_overrides_are_bounded() {
        let mut req = request();
        req.levels_total = Some(0);
        assert!(validate_policy_overrides(&req).is_err());

        let mut req = request();
        req.pass_threshold = Some(120.0);
        assert!(validate_policy_overrides(&req).is_err());

        let mut req = request();
        req.max_attempts = Some(0);
        assert!(validate_policy_overrides(&req).is_err());

        let mut req = request();
        req.levels_total = Some(3);
        req.pass_threshold = Some(80.0);
        req.max_attempts = Some(3);
        assert!(validate_policy_overrides(&req).is_ok());
    }
}
