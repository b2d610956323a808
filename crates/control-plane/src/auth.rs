use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, Request, header::AUTHORIZATION},
    middleware::Next,
};
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    telemetry,
};

pub async fn require_operator_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let request_id = telemetry::request_id_from_request(&req);
    let path = format!("{} {}", req.method(), req.uri().path());
    let token = match extract_bearer_from_header(
        req.headers(),
        &state.operator_auth.header_name,
        "operator authorization header",
    ) {
        Ok(token) => token,
        Err(err) => {
            warn!(
                request_id = request_id.as_deref(),
                path = %path,
                reason = %err.message,
                "operator authentication failed"
            );
            return Err(err);
        }
    };

    if !state.operator_auth.is_env_token(&token) {
        warn!(
            request_id = request_id.as_deref(),
            path = %path,
            "invalid operator token"
        );
        return Err(AppError::forbidden("invalid operator token"));
    }

    Ok(next.run(req).await)
}

/// Bearer token from the standard authorization header, `None` when absent or malformed.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    extract_bearer(headers)
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

pub fn extract_bearer(headers: &HeaderMap) -> ApiResult<String> {
    extract_bearer_from_header(headers, &AUTHORIZATION, "authorization header")
}

pub fn extract_bearer_from_header(
    headers: &HeaderMap,
    header: &HeaderName,
    context: &str,
) -> ApiResult<String> {
    let value = headers
        .get(header)
        .ok_or_else(|| AppError::unauthorized(format!("missing {context}")))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("invalid {context}")))?;

    let prefix = "Bearer ";
    if !value.starts_with(prefix) {
        return Err(AppError::unauthorized(format!("invalid {context} scheme")));
    }

    Ok(value[prefix.len()..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    #[test]
    fn extract_bearer_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            extract_bearer(&headers).unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let err = extract_bearer(&headers).unwrap_err();
        assert!(err.message.contains("scheme"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer(&headers).unwrap(), "abc");
    }

    #[test]
    fn bearer_token_ignores_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok"));
    }

    #[test]
    fn custom_operator_header_is_honoured() {
        let header = HeaderName::from_static("x-operator-token");
        let mut headers = HeaderMap::new();
        headers.insert(header.clone(), HeaderValue::from_static("Bearer op"));
        assert_eq!(
            extract_bearer_from_header(&headers, &header, "operator header").unwrap(),
            "op"
        );
        assert!(extract_bearer(&headers).is_err());
    }
}
