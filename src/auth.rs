use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde_json::Value;

use crate::models::error_body;

pub fn verify_bearer(
    headers: &HeaderMap,
    expected_key: Option<&str>,
) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected_key) = expected_key else {
        return Ok(());
    };
    let token = extract_bearer_token(headers)?;

    if token.trim() != expected_key {
        return Err(unauthorized("Invalid API key"));
    }

    Ok(())
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, (StatusCode, Json<Value>)> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(unauthorized("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(unauthorized("Invalid Authorization header"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(unauthorized("Authorization must use Bearer token"));
    };

    Ok(token.to_string())
}

fn unauthorized(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(error_body("UNAUTHORIZED", message)),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode};

    use super::verify_bearer;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn open_when_no_key_is_configured() {
        assert!(verify_bearer(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn accepts_matching_bearer_token() {
        assert!(verify_bearer(&headers("Bearer s3cret"), Some("s3cret")).is_ok());
    }

    #[test]
    fn rejects_missing_wrong_or_non_bearer_credentials() {
        for h in [HeaderMap::new(), headers("Bearer nope"), headers("Basic s3cret")] {
            let (status, body) = verify_bearer(&h, Some("s3cret")).expect_err("rejected");
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body.0["error"]["code"], "UNAUTHORIZED");
        }
    }
}
