use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use uuid::Uuid;

use essaylab_core::error::{ApiError, codes};
use essaylab_core::feedback::{
    EssayVersion, FeedbackRequest, FeedbackResponse, HighlightRange, ParsedFeedback,
    build_system_prompt, build_user_message, default_level_prompt, parse_feedback,
};
use essaylab_core::progress::{
    LevelPolicy, LevelProgress, apply_score, level_unlocked, session_state,
};

use crate::ai::{ChatProvider, ChatRequest, complete_with_retry};
use crate::error::AppError;
use crate::routes::extract_user_id;
use crate::routes::sessions::{Session, load_owned_session, load_progress};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/sessions/{id}/feedback", post(request_feedback))
}

fn validate_request(req: &FeedbackRequest) -> Result<(), AppError> {
    if req.essay_text.trim().is_empty() {
        return Err(AppError::Validation {
            message: "essay_text must not be empty".to_string(),
            field: Some("essay_text".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if req.level < 1 {
        return Err(AppError::Validation {
            message: "level must be a positive integer".to_string(),
            field: Some("level".to_string()),
            received: Some(serde_json::json!(req.level)),
            docs_hint: None,
        });
    }
    Ok(())
}

/// Instructions for one level: env override first, then the built-in prompt.
/// Sessions configured with more levels than the built-ins reuse the
/// highest built-in prompt.
fn level_instructions(level: i32) -> String {
    if let Ok(custom) = std::env::var(format!("ESSAYLAB_LEVEL_PROMPT_{level}")) {
        if !custom.trim().is_empty() {
            return custom;
        }
    }
    default_level_prompt(level)
        .or_else(|| default_level_prompt(3))
        .unwrap_or_default()
        .to_string()
}

#[derive(sqlx::FromRow)]
struct CachedFeedback {
    html: String,
    highlighted_areas: serde_json::Value,
    completion_score: f64,
    response_time_ms: i64,
}

/// A prior draft of the same (session, level) together with its stored
/// feedback, fetched newest first.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct PriorDraft {
    text: String,
    html: String,
    highlighted_areas: serde_json::Value,
    completion_score: f64,
    response_time_ms: i64,
}

/// The cache decision: a resubmission of an identical draft reuses the
/// stored result. Drafts arrive newest first, so the most recent identical
/// one wins.
fn cached_result(
    essay_text: &str,
    force_refresh: bool,
    prior: Vec<PriorDraft>,
) -> Option<PriorDraft> {
    if force_refresh {
        return None;
    }
    prior.into_iter().find(|draft| draft.text == essay_text)
}

enum FeedbackOutcome {
    Cached(PriorDraft),
    Fresh {
        parsed: ParsedFeedback,
        response_time_ms: i64,
    },
    Failed(FeedbackResponse),
}

/// Resolve feedback for one draft: a cache hit never reaches the provider;
/// a miss runs the bounded-retry pipeline and the parse stage. Failures
/// become structured payloads here so the handler only persists successes.
async fn obtain_feedback<P: ChatProvider>(
    provider: &P,
    cached: Option<PriorDraft>,
    chat_request: &ChatRequest,
    essay_text: &str,
    level: i32,
) -> FeedbackOutcome {
    if let Some(hit) = cached {
        return FeedbackOutcome::Cached(hit);
    }

    let started = Instant::now();
    let raw = match complete_with_retry(provider, chat_request, "essay_feedback").await {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(level, error = %err, "feedback pipeline unavailable");
            return FeedbackOutcome::Failed(FeedbackResponse::failure(
                codes::AI_SERVICE_UNAVAILABLE,
                "The feedback service is temporarily unavailable. Please try again.".to_string(),
                level,
            ));
        }
    };

    match parse_feedback(&raw, essay_text, level) {
        Ok(parsed) => FeedbackOutcome::Fresh {
            parsed,
            response_time_ms: started.elapsed().as_millis() as i64,
        },
        Err(err) => {
            tracing::warn!(level, error = %err, "feedback response unparseable");
            FeedbackOutcome::Failed(FeedbackResponse::failure(
                codes::AI_PARSE_ERROR,
                "The feedback response could not be processed. Please try again.".to_string(),
                level,
            ))
        }
    }
}

fn decode_highlights(value: serde_json::Value) -> Result<Vec<HighlightRange>, AppError> {
    serde_json::from_value(value)
        .map_err(|err| AppError::Internal(format!("stored highlights failed to decode: {err}")))
}

/// Request AI feedback for an essay draft
///
/// Persists the draft as a new immutable version, serves an identical prior
/// draft from the feedback cache, and otherwise runs the provider pipeline:
/// bounded retries, highlight extraction, score clamping, progress update.
/// Pipeline failures come back as HTTP 200 with `success: false` so the
/// client can always offer a retry.
#[utoipa::path(
    post,
    path = "/v1/sessions/{id}/feedback",
    request_body = FeedbackRequest,
    responses(
        (status = 200, description = "Feedback result or structured pipeline failure", body = FeedbackResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 403, description = "Not the session owner, or level locked", body = ApiError),
        (status = 404, description = "No such session", body = ApiError)
    ),
    params(
        ("id" = Uuid, Path, description = "Session id"),
        ("x-user-id" = i64, Header, description = "Platform user id")
    ),
    tag = "feedback"
)]
pub async fn request_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    Json(req): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_request(&req)?;

    let session = load_owned_session(&state.db, session_id, user_id).await?;
    let policy = session.policy();
    let progress = load_progress(&state.db, session_id).await?;

    if !level_unlocked(req.level, &progress, &policy) {
        return Err(AppError::Forbidden {
            message: format!("Level {} is locked for this session", req.level),
            docs_hint: Some("Complete the previous level to unlock it.".to_string()),
        });
    }

    // The draft log is append-only: every request writes a version, cache
    // hit or not.
    let version = EssayVersion {
        id: Uuid::now_v7(),
        session_id,
        level: req.level,
        text: req.essay_text.clone(),
        created_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO essay_versions (id, session_id, level, text, created_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(version.id)
    .bind(version.session_id)
    .bind(version.level)
    .bind(&version.text)
    .bind(version.created_at)
    .execute(&state.db)
    .await?;
    let version_id = version.id;

    mark_level_entered(&state.db, session_id, req.level).await?;

    let prior: Vec<PriorDraft> = if req.force_refresh {
        Vec::new()
    } else {
        sqlx::query_as(
            r#"
            SELECT v.text, f.html, f.highlighted_areas, f.completion_score, f.response_time_ms
            FROM essay_versions v
            JOIN essay_feedback f ON f.version_id = v.id AND f.level = $2
            WHERE v.session_id = $1 AND v.level = $2 AND v.id <> $3
            ORDER BY v.created_at DESC
            LIMIT 25
            "#,
        )
        .bind(session_id)
        .bind(req.level)
        .bind(version_id)
        .fetch_all(&state.db)
        .await?
    };
    let cached = cached_result(&req.essay_text, req.force_refresh, prior);

    let system = build_system_prompt(req.level, &level_instructions(req.level));
    let user_message = build_user_message(&req.essay_text, None);
    let chat_request = ChatRequest::new(system, user_message);

    match obtain_feedback(
        state.ai.as_ref(),
        cached,
        &chat_request,
        &req.essay_text,
        req.level,
    )
    .await
    {
        FeedbackOutcome::Failed(payload) => {
            tracing::warn!(%session_id, level = req.level, error = ?payload.error, "feedback request failed");
            Ok(Json(payload))
        }
        FeedbackOutcome::Cached(hit) => {
            tracing::info!(%session_id, level = req.level, "feedback served from cache");
            Ok(Json(FeedbackResponse {
                success: true,
                cached: Some(true),
                version_id: Some(version_id),
                feedback_html: Some(hit.html),
                highlighted_areas: Some(decode_highlights(hit.highlighted_areas)?),
                completion_score: Some(hit.completion_score),
                level: req.level,
                response_time_ms: Some(hit.response_time_ms),
                error: None,
                error_message: None,
            }))
        }
        FeedbackOutcome::Fresh {
            parsed,
            response_time_ms,
        } => {
            let stored =
                persist_feedback(&state.db, version_id, req.level, &parsed, response_time_ms)
                    .await?;
            record_score(&state.db, &session, req.level, stored.completion_score, &policy).await?;

            tracing::info!(
                %session_id,
                level = req.level,
                score = stored.completion_score,
                response_time_ms,
                "feedback generated"
            );

            Ok(Json(FeedbackResponse {
                success: true,
                cached: Some(false),
                version_id: Some(version_id),
                feedback_html: Some(stored.html),
                highlighted_areas: Some(decode_highlights(stored.highlighted_areas)?),
                completion_score: Some(stored.completion_score),
                level: req.level,
                response_time_ms: Some(stored.response_time_ms),
                error: None,
                error_message: None,
            }))
        }
    }
}

/// First feedback request against a level moves it to in_progress. Repeat
/// requests are no-ops.
async fn mark_level_entered(
    pool: &sqlx::PgPool,
    session_id: Uuid,
    level: i32,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO essay_progress (session_id, level, attempts_used, best_score, state, updated_at) \
         VALUES ($1, $2, 0, 0, 'in_progress', $3) \
         ON CONFLICT (session_id, level) DO NOTHING",
    )
    .bind(session_id)
    .bind(level)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Write the feedback row and read back whatever won. A concurrent request
/// for the same (version, level) is benign; both callers see one result.
async fn persist_feedback(
    pool: &sqlx::PgPool,
    version_id: Uuid,
    level: i32,
    parsed: &ParsedFeedback,
    response_time_ms: i64,
) -> Result<CachedFeedback, AppError> {
    let highlights_json = serde_json::to_value(&parsed.highlights)
        .map_err(|err| AppError::Internal(format!("highlights failed to encode: {err}")))?;

    sqlx::query(
        "INSERT INTO essay_feedback \
         (version_id, level, html, highlighted_areas, completion_score, response_time_ms, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (version_id, level) DO NOTHING",
    )
    .bind(version_id)
    .bind(level)
    .bind(&parsed.html)
    .bind(&highlights_json)
    .bind(parsed.completion_score)
    .bind(response_time_ms)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let stored: CachedFeedback = sqlx::query_as(
        "SELECT html, highlighted_areas, completion_score, response_time_ms \
         FROM essay_feedback WHERE version_id = $1 AND level = $2",
    )
    .bind(version_id)
    .bind(level)
    .fetch_one(pool)
    .await?;

    Ok(stored)
}

/// Charge the attempt, fold the score into per-level progress, and refresh
/// the session's derived status. Only successfully scored responses reach
/// this point; failures charge nothing.
async fn record_score(
    pool: &sqlx::PgPool,
    session: &Session,
    level: i32,
    score: f64,
    policy: &LevelPolicy,
) -> Result<(), AppError> {
    let progress = load_progress(pool, session.id).await?;
    let mut current = progress
        .iter()
        .find(|item| item.level == level)
        .copied()
        .unwrap_or_else(|| LevelProgress::entered(level));

    apply_score(&mut current, score, policy);

    sqlx::query(
        "INSERT INTO essay_progress (session_id, level, attempts_used, best_score, state, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (session_id, level) DO UPDATE SET \
             attempts_used = EXCLUDED.attempts_used, \
             best_score = EXCLUDED.best_score, \
             state = EXCLUDED.state, \
             updated_at = EXCLUDED.updated_at",
    )
    .bind(session.id)
    .bind(level)
    .bind(current.attempts_used)
    .bind(current.best_score)
    .bind(current.state.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let refreshed = load_progress(pool, session.id).await?;
    let status = match session_state(&refreshed, policy) {
        essaylab_core::progress::SessionState::NotStarted => "not_started",
        essaylab_core::progress::SessionState::InProgress => "in_progress",
        essaylab_core::progress::SessionState::SubmissionAllowed => "submission_allowed",
    };
    sqlx::query("UPDATE essay_sessions SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(session.id)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use essaylab_core::feedback::FeedbackRequest;

    use crate::ai::{ChatProvider, ChatRequest, ProviderError};

    use super::{
        FeedbackOutcome, PriorDraft, cached_result, level_instructions, obtain_feedback,
        validate_request,
    };

    fn request(essay: &str, level: i32) -> FeedbackRequest {
        FeedbackRequest {
            essay_text: essay.to_string(),
            level,
            force_refresh: false,
        }
    }

    fn draft(text: &str, score: f64) -> PriorDraft {
        PriorDraft {
            text: text.to_string(),
            html: format!("<div>{text}</div>"),
            highlighted_areas: serde_json::json!([]),
            completion_score: score,
            response_time_ms: 1200,
        }
    }

    struct CountingProvider {
        calls: AtomicU32,
        reply: &'static str,
    }

    impl ChatProvider for CountingProvider {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    fn chat_request() -> ChatRequest {
        ChatRequest::new("system".to_string(), "essay".to_string())
    }

    #[test]
    fn empty_essays_are_rejected() {
        assert!(validate_request(&request("", 1)).is_err());
        assert!(validate_request(&request("   \n", 1)).is_err());
        assert!(validate_request(&request("A real draft.", 1)).is_ok());
    }

    #[test]
    fn level_must_be_positive() {
        assert!(validate_request(&request("A real draft.", 0)).is_err());
        assert!(validate_request(&request("A real draft.", -1)).is_err());
    }

    #[test]
    fn levels_beyond_the_built_ins_fall_back_to_the_highest_prompt() {
        assert_eq!(level_instructions(5), level_instructions(3));
        assert_ne!(level_instructions(1), level_instructions(3));
    }

    #[test]
    fn identical_prior_draft_hits_the_cache() {
        let prior = vec![draft("My essay.", 72.0)];
        let hit = cached_result("My essay.", false, prior).expect("identical text must hit");
        assert_eq!(hit.completion_score, 72.0);
    }

    #[test]
    fn changed_text_and_force_refresh_miss_the_cache() {
        assert!(cached_result("A new draft.", false, vec![draft("My essay.", 72.0)]).is_none());
        assert!(cached_result("My essay.", true, vec![draft("My essay.", 72.0)]).is_none());
    }

    #[test]
    fn newest_identical_draft_wins() {
        let prior = vec![draft("My essay.", 90.0), draft("My essay.", 55.0)];
        let hit = cached_result("My essay.", false, prior).unwrap();
        assert_eq!(hit.completion_score, 90.0);
    }

    #[tokio::test]
    async fn cache_hit_never_calls_the_provider() {
        let provider = CountingProvider {
            calls: AtomicU32::new(0),
            reply: "Score: 10\nShould never be seen.",
        };
        let hit = draft("My essay.", 72.0);

        let outcome =
            obtain_feedback(&provider, Some(hit), &chat_request(), "My essay.", 1).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        match outcome {
            FeedbackOutcome::Cached(cached) => assert_eq!(cached.completion_score, 72.0),
            _ => panic!("cache hit must resolve to the stored result"),
        }
    }

    #[tokio::test]
    async fn cache_miss_calls_the_provider_once() {
        let provider = CountingProvider {
            calls: AtomicU32::new(0),
            reply: "Score: 70\nSolid draft.",
        };

        let outcome = obtain_feedback(&provider, None, &chat_request(), "My essay.", 1).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        match outcome {
            FeedbackOutcome::Fresh { parsed, .. } => assert_eq!(parsed.completion_score, 70.0),
            _ => panic!("cache miss must produce fresh feedback"),
        }
    }
}
