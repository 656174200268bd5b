//! Admin JSON API: accounts CRUD, quota sync, logs, settings, api keys.
//! Authenticated with `Authorization: Bearer <ADMIN_PASSWORD>`.

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use agpool_storage::{AccountRow, NewAccount, hash_api_key};

use crate::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/accounts/{id}", delete(delete_account))
        .route("/accounts/{id}/refresh", post(refresh_account))
        .route("/accounts/{id}/quota-sync", post(quota_sync))
        .route("/overview", get(overview))
        .route("/logs/attempts", get(attempt_logs))
        .route("/settings", get(list_settings).put(put_setting))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/{id}", delete(delete_api_key))
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

async fn admin_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(admin) = state.cfg.admin_password.as_deref() else {
        return error(StatusCode::FORBIDDEN, "admin password not configured");
    };
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if provided != Some(admin) {
        return error(StatusCode::UNAUTHORIZED, "invalid admin credentials");
    }
    next.run(req).await
}

async fn list_accounts(State(state): State<AppState>) -> Response {
    match state.store.list_accounts().await {
        Ok(rows) => {
            let accounts: Vec<serde_json::Value> = rows.iter().map(account_json).collect();
            axum::Json(serde_json::json!({ "accounts": accounts })).into_response()
        }
        Err(err) => internal(&err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateAccountBody {
    refresh_token: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

async fn create_account(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<CreateAccountBody>,
) -> Response {
    if body.refresh_token.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "refresh_token is required");
    }
    let (instance_id, device_fingerprint, session_id) = agpool_core::new_device_identity();
    let new = NewAccount {
        email: body.email,
        refresh_token: body.refresh_token,
        project_id: body.project_id,
        instance_id: Some(instance_id),
        device_fingerprint: Some(device_fingerprint),
        session_id: Some(session_id),
        ..Default::default()
    };
    let row = match state.store.insert_account(new).await {
        Ok(row) => row,
        Err(err) => return internal(&err.to_string()),
    };

    // Activate in the background: token, project, profile, quota, then the
    // camouflage schedulers.
    let activate_state = state.clone();
    let account_id = row.id;
    tokio::spawn(async move {
        activate_account(activate_state, account_id).await;
    });

    (StatusCode::CREATED, axum::Json(account_json(&row))).into_response()
}

async fn activate_account(state: AppState, account_id: i64) {
    let cancel = CancellationToken::new();
    let account = match state.tokens.force_refresh(account_id).await {
        Ok(account) => account,
        Err(err) => {
            tracing::warn!(account_id, error = %err, "account activation refresh failed");
            return;
        }
    };
    if account
        .project_id
        .as_deref()
        .is_none_or(|p| p.trim().is_empty())
    {
        match state.tokens.fetch_project_id(&account, &cancel).await {
            Ok(project) => {
                let _ = state
                    .store
                    .update_account_identity(account_id, None, None, Some(&project))
                    .await;
            }
            Err(err) => {
                tracing::warn!(account_id, error = %err, "project onboarding failed")
            }
        }
    }
    if let Err(err) = state.tokens.sync_account_profile(&account, &cancel).await {
        tracing::debug!(account_id, error = %err, "profile sync failed");
    }
    if let Err(err) = state.tokens.sync_account_quota(&account, &cancel).await {
        tracing::warn!(account_id, error = %err, "quota sync failed");
    }
    if let Ok(fresh) = state.store.get_account(account_id).await {
        state.camouflage.start_account(&fresh);
    }
}

async fn delete_account(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    state.camouflage.stop_account(id);
    match state.store.delete_account(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal(&err.to_string()),
    }
}

async fn refresh_account(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.tokens.force_refresh(id).await {
        Ok(row) => axum::Json(account_json(&row)).into_response(),
        Err(err) => error(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

async fn quota_sync(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let cancel = CancellationToken::new();
    let account = match state.store.get_account(id).await {
        Ok(account) => account,
        Err(err) => return error(StatusCode::NOT_FOUND, &err.to_string()),
    };
    if let Err(err) = state.tokens.sync_account_quota(&account, &cancel).await {
        return error(StatusCode::BAD_GATEWAY, &err.to_string());
    }
    let quotas = match state.store.model_quotas(id).await {
        Ok(rows) => rows,
        Err(err) => return internal(&err.to_string()),
    };
    let quotas: Vec<serde_json::Value> = quotas
        .iter()
        .map(|q| {
            serde_json::json!({
                "model": q.model,
                "quota_remaining": q.quota_remaining,
                "quota_reset_time": q.quota_reset_time,
            })
        })
        .collect();
    axum::Json(serde_json::json!({ "account_id": id, "quotas": quotas })).into_response()
}

async fn overview(State(state): State<AppState>) -> Response {
    axum::Json(state.pool.group_routing_overview().await).into_response()
}

#[derive(Debug, Deserialize)]
struct AttemptLogQuery {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    100
}

async fn attempt_logs(
    State(state): State<AppState>,
    Query(query): Query<AttemptLogQuery>,
) -> Response {
    let rows = match &query.request_id {
        Some(request_id) => state.store.attempts_for_request(request_id).await,
        None => state.store.recent_attempts(query.limit.min(1000)).await,
    };
    match rows {
        Ok(rows) => {
            let attempts: Vec<serde_json::Value> = rows
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "request_id": a.request_id,
                        "account_id": a.account_id,
                        "model": a.model,
                        "attempt_no": a.attempt_no,
                        "account_attempt": a.account_attempt,
                        "same_retry": a.same_retry,
                        "status": a.status,
                        "latency_ms": a.latency_ms,
                        "error_message": a.error_message,
                        "started_at": a.started_at,
                    })
                })
                .collect();
            axum::Json(serde_json::json!({ "attempts": attempts })).into_response()
        }
        Err(err) => internal(&err.to_string()),
    }
}

async fn list_settings(State(state): State<AppState>) -> Response {
    match state.store.all_settings().await {
        Ok(rows) => {
            let mut map = serde_json::Map::new();
            for row in rows {
                map.insert(row.key, serde_json::Value::String(row.value));
            }
            axum::Json(serde_json::Value::Object(map)).into_response()
        }
        Err(err) => internal(&err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct PutSettingBody {
    key: String,
    value: String,
}

async fn put_setting(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<PutSettingBody>,
) -> Response {
    match state.store.put_setting(&body.key, &body.value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal(&err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateApiKeyBody {
    key: String,
    #[serde(default)]
    label: Option<String>,
}

async fn create_api_key(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<CreateApiKeyBody>,
) -> Response {
    if body.key.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "key is required");
    }
    match state
        .store
        .add_api_key(&hash_api_key(body.key.trim()), body.label.as_deref())
        .await
    {
        Ok(id) => (
            StatusCode::CREATED,
            axum::Json(serde_json::json!({ "id": id })),
        )
            .into_response(),
        Err(err) => internal(&err.to_string()),
    }
}

async fn list_api_keys(State(state): State<AppState>) -> Response {
    match state.store.list_api_keys().await {
        Ok(rows) => {
            let keys: Vec<serde_json::Value> = rows
                .iter()
                .map(|k| {
                    serde_json::json!({
                        "id": k.id,
                        "label": k.label,
                        "enabled": k.enabled,
                    })
                })
                .collect();
            axum::Json(serde_json::json!({ "api_keys": keys })).into_response()
        }
        Err(err) => internal(&err.to_string()),
    }
}

async fn delete_api_key(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_api_key(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal(&err.to_string()),
    }
}

/// Account view with credentials redacted.
fn account_json(row: &AccountRow) -> serde_json::Value {
    serde_json::json!({
        "id": row.id,
        "email": row.email,
        "project_id": row.project_id,
        "tier": row.tier,
        "status": row.status,
        "error_count": row.error_count,
        "last_error": row.last_error,
        "last_used_at": row.last_used_at,
        "quota_remaining": row.quota_remaining,
        "quota_reset_time": row.quota_reset_time,
        "has_access_token": row.access_token.is_some(),
        "token_expires_at": row.token_expires_at,
        "created_at": row.created_at.to_string(),
    })
}

fn error(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "error": { "message": message } })),
    )
        .into_response()
}

fn internal(message: &str) -> Response {
    error(StatusCode::INTERNAL_SERVER_ERROR, message)
}
