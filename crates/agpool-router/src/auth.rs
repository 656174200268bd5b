//! Downstream client authentication.
//!
//! Any of the dialects' native key headers is accepted; the key must match
//! the configured set (env keys plus enabled DB keys). With no API_KEY
//! configured, the admin password doubles as a client key.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use agpool_storage::hash_api_key;

use crate::AppState;

pub async fn downstream_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(candidate) = extract_key(&req) else {
        return unauthorized("missing api key");
    };

    if state.cfg.api_keys.iter().any(|key| *key == candidate) {
        return next.run(req).await;
    }

    if state.cfg.api_keys.is_empty()
        && state
            .cfg
            .admin_password
            .as_deref()
            .is_some_and(|admin| admin == candidate)
    {
        return next.run(req).await;
    }

    let hash = hash_api_key(&candidate);
    match state.store.enabled_key_hashes().await {
        Ok(hashes) if hashes.contains(&hash) => next.run(req).await,
        Ok(_) => unauthorized("invalid api key"),
        Err(err) => {
            tracing::warn!(error = %err, "api key lookup failed");
            unauthorized("invalid api key")
        }
    }
}

fn extract_key(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    for name in ["x-api-key", "x-goog-api-key", "anthropic-api-key"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    // Gemini clients put the key in the query string.
    let query = req.uri().query()?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=")
            && !value.is_empty()
        {
            return Some(value.to_string());
        }
    }
    None
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({
            "error": {
                "message": message,
                "type": "authentication_error",
                "code": "invalid_api_key",
            }
        })),
    )
        .into_response()
}
