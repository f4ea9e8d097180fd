use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use essaylab_core::error::ApiError;
use essaylab_core::flags::{Flag, FlagColor};

use crate::error::AppError;
use crate::routes::extract_user_id;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/flags", put(toggle_flag).get(list_flags))
        .route("/v1/flags/{question_id}", delete(remove_flag))
}

fn default_all_versions() -> bool {
    true
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ToggleFlagRequest {
    pub question_id: i64,
    pub color: FlagColor,
    /// Also write the flag to every other version of the same bank entry.
    #[serde(default = "default_all_versions")]
    pub all_versions: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ToggleFlagResponse {
    pub flag: Flag,
    /// Number of rows written including the target question itself.
    pub written: u64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RemoveFlagResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct FlagListResponse {
    pub flags: Vec<Flag>,
}

#[derive(sqlx::FromRow)]
struct FlagRow {
    id: i64,
    user_id: i64,
    question_id: i64,
    color: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl FlagRow {
    fn into_flag(self) -> Result<Flag, AppError> {
        let color = FlagColor::parse(&self.color).ok_or_else(|| {
            AppError::Internal(format!("unknown flag color in storage: {}", self.color))
        })?;
        Ok(Flag {
            id: self.id,
            user_id: self.user_id,
            question_id: self.question_id,
            color,
            created_at: self.created_at,
            modified_at: self.modified_at,
        })
    }
}

fn validate_question_id(question_id: i64) -> Result<(), AppError> {
    if question_id <= 0 {
        return Err(AppError::Validation {
            message: "question_id must be a positive integer".to_string(),
            field: Some("question_id".to_string()),
            received: Some(serde_json::json!(question_id)),
            docs_hint: None,
        });
    }
    Ok(())
}

/// Set or change a flag
///
/// Upserts the flag on the target question and, unless `all_versions` is
/// false, on every sibling version of the same bank entry with the same
/// timestamp. The upsert is a single atomic statement per row, so a
/// concurrent toggle never produces a duplicate.
#[utoipa::path(
    put,
    path = "/v1/flags",
    request_body = ToggleFlagRequest,
    responses(
        (status = 200, description = "Flag written", body = ToggleFlagResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    params(
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "flags"
)]
pub async fn toggle_flag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ToggleFlagRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_question_id(req.question_id)?;

    let now = Utc::now();
    let mut written = 0u64;

    // Upsert the target question first; it may not be registered in the
    // version table at all, in which case propagation finds no siblings and
    // the background engine skips the group.
    let row: FlagRow = sqlx::query_as(
        r#"
        INSERT INTO question_flags (user_id, question_id, color, created_at, modified_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (user_id, question_id)
        DO UPDATE SET color = EXCLUDED.color, modified_at = EXCLUDED.modified_at
        RETURNING id, user_id, question_id, color, created_at, modified_at
        "#,
    )
    .bind(user_id)
    .bind(req.question_id)
    .bind(req.color.as_str())
    .bind(now)
    .fetch_one(&state.db)
    .await?;
    written += 1;

    if req.all_versions {
        let result = sqlx::query(
            r#"
            INSERT INTO question_flags (user_id, question_id, color, created_at, modified_at)
            SELECT $1, v.question_id, $2, $3, $3
            FROM question_versions v
            WHERE v.question_bank_entry_id = (
                SELECT question_bank_entry_id FROM question_versions WHERE question_id = $4
            )
            AND v.question_id <> $4
            ON CONFLICT (user_id, question_id)
            DO UPDATE SET color = EXCLUDED.color, modified_at = EXCLUDED.modified_at
            "#,
        )
        .bind(user_id)
        .bind(req.color.as_str())
        .bind(now)
        .bind(req.question_id)
        .execute(&state.db)
        .await?;
        written += result.rows_affected();
    }

    tracing::info!(
        user_id,
        question_id = req.question_id,
        color = req.color.as_str(),
        written,
        "flag toggled"
    );

    Ok(Json(ToggleFlagResponse {
        flag: row.into_flag()?,
        written,
    }))
}

/// Remove a flag
///
/// Deletes the caller's flag from the question and, unless `all_versions=false`,
/// from every sibling version of the same bank entry. Missing flags delete
/// zero rows; the call is idempotent.
#[utoipa::path(
    delete,
    path = "/v1/flags/{question_id}",
    responses(
        (status = 200, description = "Flags removed", body = RemoveFlagResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    params(
        ("question_id" = i64, Path, description = "Question to unflag"),
        ("all_versions" = Option<bool>, Query, description = "Also remove from sibling versions (default true)"),
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "flags"
)]
pub async fn remove_flag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(question_id): Path<i64>,
    axum::extract::Query(query): axum::extract::Query<RemoveFlagQuery>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_question_id(question_id)?;

    let result = if query.all_versions.unwrap_or(true) {
        sqlx::query(
            r#"
            DELETE FROM question_flags
            WHERE user_id = $1
            AND (question_id = $2 OR question_id IN (
                SELECT v.question_id FROM question_versions v
                WHERE v.question_bank_entry_id = (
                    SELECT question_bank_entry_id FROM question_versions WHERE question_id = $2
                )
            ))
            "#,
        )
        .bind(user_id)
        .bind(question_id)
        .execute(&state.db)
        .await?
    } else {
        sqlx::query("DELETE FROM question_flags WHERE user_id = $1 AND question_id = $2")
            .bind(user_id)
            .bind(question_id)
            .execute(&state.db)
            .await?
    };

    tracing::info!(
        user_id,
        question_id,
        deleted = result.rows_affected(),
        "flag removed"
    );

    Ok(Json(RemoveFlagResponse {
        deleted: result.rows_affected(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RemoveFlagQuery {
    pub all_versions: Option<bool>,
}

/// List the caller's flags
#[utoipa::path(
    get,
    path = "/v1/flags",
    responses(
        (status = 200, description = "Flags for the calling user", body = FlagListResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    params(
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "flags"
)]
pub async fn list_flags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;

    let rows: Vec<FlagRow> = sqlx::query_as(
        "SELECT id, user_id, question_id, color, created_at, modified_at \
         FROM question_flags WHERE user_id = $1 ORDER BY question_id ASC",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await?;

    let flags = rows
        .into_iter()
        .map(FlagRow::into_flag)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((StatusCode::OK, Json(FlagListResponse { flags })))
}

#[cfg(test)]
mod tests {
    use super::validate_question_id;

    #[test]
    fn question_id_must_be_positive() {
        assert!(validate_question_id(1).is_ok());
        assert!(validate_question_id(0).is_err());
        assert!(validate_question_id(-5).is_err());
    }
}
