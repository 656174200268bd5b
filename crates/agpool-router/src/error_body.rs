//! Per-dialect error envelopes.

use agpool_core::UpstreamError;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Claude,
    Gemini,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
        }
    }
}

pub fn error_response(dialect: Dialect, err: &UpstreamError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = err.to_string();
    let code = err.code();

    let body = match dialect {
        Dialect::OpenAi => serde_json::json!({
            "error": {
                "message": message,
                "type": openai_error_type(status),
                "code": code,
            }
        }),
        Dialect::Claude => serde_json::json!({
            "type": "error",
            "error": {
                "type": claude_error_type(status),
                "message": message,
            }
        }),
        Dialect::Gemini => serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "status": gemini_status(status),
                "message": message,
            }
        }),
    };

    let mut response = (status, axum::Json(body)).into_response();
    if status == StatusCode::TOO_MANY_REQUESTS
        && let Some(retry_after_ms) = err.retry_after_ms()
    {
        let secs = retry_after_ms.div_ceil(1000).max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn openai_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        _ => "api_error",
    }
}

fn claude_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn gemini_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        499 => "CANCELLED",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_sets_retry_after() {
        let err = UpstreamError::NoCapacity {
            message: "No capacity available, reset after 7s".into(),
            retry_after_ms: Some(7_400),
        };
        let resp = error_response(Dialect::OpenAi, &err);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("8")
        );
    }

    #[test]
    fn bad_request_maps_to_400_everywhere() {
        let err = UpstreamError::BadRequest {
            message: "invalid json".into(),
        };
        for dialect in [Dialect::OpenAi, Dialect::Claude, Dialect::Gemini] {
            assert_eq!(error_response(dialect, &err).status(), StatusCode::BAD_REQUEST);
        }
    }
}
