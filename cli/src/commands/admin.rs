use crate::util::api_request;

pub async fn reconcile(api_url: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        "/v1/admin/reconcile",
        None,
        None,
        &[],
    )
    .await
}
