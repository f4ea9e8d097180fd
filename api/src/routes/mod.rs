use axum::http::HeaderMap;

use crate::error::AppError;

pub mod admin;
pub mod feedback;
pub mod flags;
pub mod health;
pub mod sessions;

/// Extract the platform user id from the `x-user-id` header. The API sits
/// behind the learning platform, which authenticates the user and forwards
/// its numeric id.
pub(crate) fn extract_user_id(headers: &HeaderMap) -> Result<i64, AppError> {
    let header_val = headers
        .get("x-user-id")
        .ok_or_else(|| AppError::Validation {
            message: "x-user-id header is required".to_string(),
            field: Some("headers.x-user-id".to_string()),
            received: None,
            docs_hint: Some(
                "Pass the platform user id as the x-user-id header, e.g. 'x-user-id: 42'."
                    .to_string(),
            ),
        })?;

    let user_id_str = header_val.to_str().map_err(|_| AppError::Validation {
        message: "x-user-id must be a valid UTF-8 string".to_string(),
        field: Some("headers.x-user-id".to_string()),
        received: None,
        docs_hint: None,
    })?;

    let user_id: i64 = user_id_str.parse().map_err(|_| AppError::Validation {
        message: "x-user-id must be a positive integer".to_string(),
        field: Some("headers.x-user-id".to_string()),
        received: Some(serde_json::Value::String(user_id_str.to_string())),
        docs_hint: None,
    })?;

    if user_id <= 0 {
        return Err(AppError::Validation {
            message: "x-user-id must be a positive integer".to_string(),
            field: Some("headers.x-user-id".to_string()),
            received: Some(serde_json::json!(user_id)),
            docs_hint: None,
        });
    }

    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::extract_user_id;

    #[test]
    fn user_id_header_parses() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "42".parse().unwrap());
        assert_eq!(extract_user_id(&headers).unwrap(), 42);
    }

    #[test]
    fn missing_header_is_a_validation_error() {
        assert!(extract_user_id(&HeaderMap::new()).is_err());
    }

    #[test]
    fn non_numeric_and_non_positive_ids_are_rejected() {
        for bad in ["abc", "0", "-3", "4.5"] {
            let mut headers = HeaderMap::new();
            headers.insert("x-user-id", bad.parse().unwrap());
            assert!(extract_user_id(&headers).is_err(), "{bad} must be rejected");
        }
    }
}
