use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};

pub const ADMIN_TOKEN_HEADER: &str = "x-quoteflow-admin-token";

fn extract_bearer_token(raw: &str) -> Option<&str> {
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
}

/// Admin endpoints require the configured token. With no token configured they
/// are closed rather than open.
pub fn ensure_admin_authorized(
    headers: &HeaderMap,
    expected: Option<&str>,
) -> std::result::Result<(), (StatusCode, String)> {
    let Some(expected) = expected.map(str::trim).filter(|t| !t.is_empty()) else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "admin auth is required but api.admin_token is not configured".to_string(),
        ));
    };

    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(extract_bearer_token)
        });

    if token.is_some_and(|v| v == expected) {
        return Ok(());
    }

    Err((
        StatusCode::UNAUTHORIZED,
        "admin auth failed (missing/invalid token)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_and_header_tokens_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(ensure_admin_authorized(&headers, Some("s3cret")).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(ensure_admin_authorized(&headers, Some("s3cret")).is_ok());
    }

    #[test]
    fn test_missing_or_wrong_token_rejected() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            ensure_admin_authorized(&headers, Some("s3cret")).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert_eq!(
            ensure_admin_authorized(&headers, Some("s3cret")).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ensure_admin_authorized(&headers, None).unwrap_err().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
