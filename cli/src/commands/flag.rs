use serde_json::json;

use essaylab_core::flags::FlagColor;

use crate::util::{api_request, exit_error};

pub async fn set(
    api_url: &str,
    user_id: &str,
    question_id: i64,
    color: &str,
    all_versions: bool,
) -> i32 {
    if FlagColor::parse(color).is_none() {
        exit_error(
            &format!("Unknown flag color '{color}'"),
            Some("Use 'blue' or 'red'."),
        );
    }

    api_request(
        api_url,
        reqwest::Method::PUT,
        "/v1/flags",
        Some(user_id),
        Some(json!({
            "question_id": question_id,
            "color": color,
            "all_versions": all_versions,
        })),
        &[],
    )
    .await
}

pub async fn unset(api_url: &str, user_id: &str, question_id: i64, all_versions: bool) -> i32 {
    api_request(
        api_url,
        reqwest::Method::DELETE,
        &format!("/v1/flags/{question_id}"),
        Some(user_id),
        None,
        &[("all_versions".to_string(), all_versions.to_string())],
    )
    .await
}

pub async fn list(api_url: &str, user_id: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        "/v1/flags",
        Some(user_id),
        None,
        &[],
    )
    .await
}
