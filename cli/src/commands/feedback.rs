use serde_json::json;

use crate::util::{api_request, exit_error, read_text_from_file};

pub async fn request(
    api_url: &str,
    user_id: &str,
    session_id: &str,
    essay_file: &str,
    level: i32,
    force_refresh: bool,
) -> i32 {
    let essay_text = match read_text_from_file(essay_file) {
        Ok(text) => text,
        Err(e) => exit_error(&e, Some("Pass a file path, or '-' to read from stdin.")),
    };

    api_request(
        api_url,
        reqwest::Method::POST,
        &format!("/v1/sessions/{session_id}/feedback"),
        Some(user_id),
        Some(json!({
            "essay_text": essay_text,
            "level": level,
            "force_refresh": force_refresh,
        })),
        &[],
    )
    .await
}
