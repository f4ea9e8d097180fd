use serde_json::json;

use crate::util::api_request;

#[allow(clippy::too_many_arguments)]
pub async fn create(
    api_url: &str,
    user_id: &str,
    attempt_id: i64,
    quiz_id: i64,
    levels_total: Option<i32>,
    pass_threshold: Option<f64>,
    max_attempts: Option<i32>,
    advance_on_exhaustion: Option<bool>,
) -> i32 {
    let mut body = json!({
        "attempt_id": attempt_id,
        "quiz_id": quiz_id,
    });
    if let Some(levels) = levels_total {
        body["levels_total"] = json!(levels);
    }
    if let Some(threshold) = pass_threshold {
        body["pass_threshold"] = json!(threshold);
    }
    if let Some(attempts) = max_attempts {
        body["max_attempts"] = json!(attempts);
    }
    if let Some(advance) = advance_on_exhaustion {
        body["advance_on_exhaustion"] = json!(advance);
    }

    api_request(
        api_url,
        reqwest::Method::POST,
        "/v1/sessions",
        Some(user_id),
        Some(body),
        &[],
    )
    .await
}

pub async fn show(api_url: &str, user_id: &str, session_id: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        &format!("/v1/sessions/{session_id}"),
        Some(user_id),
        None,
        &[],
    )
    .await
}

pub async fn progress(api_url: &str, user_id: &str, session_id: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        &format!("/v1/sessions/{session_id}/progress"),
        Some(user_id),
        None,
        &[],
    )
    .await
}
