//! OAuth token lifecycle: single-flight refresh, project onboarding, and
//! email/tier/quota sync.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use tokio_util::sync::CancellationToken;

use agpool_common::models::{EXPOSED_MODELS, QuotaGroup, resolve_model};
use agpool_common::now_ms;
use agpool_storage::{AccountRow, STATUS_ERROR, SqliteStore};

use crate::error::{UpstreamError, UpstreamResult};
use crate::upstream::{OAUTH_CLIENT_ID, OAUTH_CLIENT_SECRET, OAUTH_TOKEN_URL, UpstreamClient};

/// Refresh this long before the recorded expiry.
pub const REFRESH_BUFFER_MS: i64 = 5 * 60_000;

const ONBOARD_ATTEMPTS: u32 = 8;
const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// `done=true` responses without a project id tolerated before giving up
/// on a tier (upstream eventual consistency).
const ONBOARD_DONE_WITHOUT_PROJECT_LIMIT: u32 = 2;

const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

type RefreshFuture =
    Shared<Pin<Box<dyn Future<Output = Result<AccountRow, UpstreamError>> + Send>>>;

/// Invoked with (account_id, access_token) after every successful refresh so
/// the heartbeat timer can hot-swap its token.
pub type TokenListener = Arc<dyn Fn(i64, String) + Send + Sync>;

pub struct TokenManager {
    store: Arc<SqliteStore>,
    upstream: Arc<UpstreamClient>,
    inflight: Mutex<HashMap<i64, RefreshFuture>>,
    listener: Mutex<Option<TokenListener>>,
}

impl TokenManager {
    pub fn new(store: Arc<SqliteStore>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            store,
            upstream,
            inflight: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn set_token_listener(&self, listener: TokenListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Refresh when the token is missing or expires within the buffer.
    pub async fn ensure_valid(&self, account: &AccountRow) -> UpstreamResult<AccountRow> {
        if let (Some(_), Some(expires_at)) = (&account.access_token, account.token_expires_at)
            && expires_at - now_ms() > REFRESH_BUFFER_MS
        {
            return Ok(account.clone());
        }
        self.force_refresh(account.id).await
    }

    /// Unconditional refresh under the per-account single flight: concurrent
    /// callers join the outstanding exchange and observe its result.
    pub async fn force_refresh(&self, account_id: i64) -> UpstreamResult<AccountRow> {
        let fut = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(existing) = inflight.get(&account_id) {
                existing.clone()
            } else {
                let store = self.store.clone();
                let upstream = self.upstream.clone();
                let listener = self.listener.lock().unwrap().clone();
                let fut: RefreshFuture =
                    do_refresh(store, upstream, listener, account_id).boxed().shared();
                inflight.insert(account_id, fut.clone());
                fut
            }
        };
        let result = fut.await;
        self.inflight.lock().unwrap().remove(&account_id);
        result
    }

    /// loadCodeAssist first; onboard under standard-tier then free-tier if
    /// the account has no project yet.
    pub async fn fetch_project_id(
        &self,
        account: &AccountRow,
        cancel: &CancellationToken,
    ) -> UpstreamResult<String> {
        let token = account
            .access_token
            .clone()
            .ok_or_else(|| UpstreamError::Auth {
                message: "account has no access token".to_string(),
                refresh_invalid: false,
            })?;

        let load = self
            .upstream
            .rpc(
                "loadCodeAssist",
                &token,
                &client_metadata_body(),
                &crate::new_internal_request_id(),
                None,
                cancel,
            )
            .await?;
        if let Some(project) = load
            .get("cloudaicompanionProject")
            .and_then(|p| p.as_str())
            .filter(|p| !p.trim().is_empty())
        {
            return Ok(project.to_string());
        }

        for tier in ["standard-tier", "free-tier"] {
            if let Some(project) = self.onboard_tier(&token, tier, cancel).await? {
                return Ok(project);
            }
        }
        Err(UpstreamError::NonRetryable {
            message: "onboarding produced no project id".to_string(),
            status: 404,
        })
    }

    /// Long-poll onboardUser until done with a project id.
    async fn onboard_tier(
        &self,
        token: &str,
        tier: &str,
        cancel: &CancellationToken,
    ) -> UpstreamResult<Option<String>> {
        let mut body = client_metadata_body();
        body["tierId"] = serde_json::Value::String(tier.to_string());

        let mut done_without_project = 0u32;
        for attempt in 0..ONBOARD_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
            }
            let resp = self
                .upstream
                .rpc(
                    "onboardUser",
                    token,
                    &body,
                    &crate::new_internal_request_id(),
                    None,
                    cancel,
                )
                .await?;
            if resp.get("done").and_then(|d| d.as_bool()) != Some(true) {
                continue;
            }
            let project = resp
                .get("response")
                .and_then(|r| r.get("cloudaicompanionProject"))
                .and_then(|p| p.get("id").or(Some(p)))
                .and_then(|p| p.as_str())
                .map(|p| p.to_string());
            match project {
                Some(project) if !project.trim().is_empty() => return Ok(Some(project)),
                _ => {
                    done_without_project += 1;
                    if done_without_project > ONBOARD_DONE_WITHOUT_PROJECT_LIMIT {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Pull the model catalog and refresh per-model and aggregate quota.
    pub async fn sync_account_quota(
        &self,
        account: &AccountRow,
        cancel: &CancellationToken,
    ) -> UpstreamResult<()> {
        let token = account
            .access_token
            .clone()
            .ok_or_else(|| UpstreamError::Auth {
                message: "account has no access token".to_string(),
                refresh_invalid: false,
            })?;
        let payload = self
            .upstream
            .rpc(
                "fetchAvailableModels",
                &token,
                &serde_json::json!({}),
                &crate::new_internal_request_id(),
                None,
                cancel,
            )
            .await?;

        let mut aggregate: Option<f64> = None;
        let mut aggregate_reset: Option<i64> = None;
        let mut wrote_any = false;

        for (model_id, meta) in iter_models(&payload) {
            let route = resolve_model(&model_id);
            if !EXPOSED_MODELS.iter().any(|m| m.upstream == route.upstream_model) {
                continue;
            }
            let Some(quota) = parse_quota(&meta) else {
                continue;
            };
            self.store
                .upsert_model_quota(
                    account.id,
                    &route.upstream_model,
                    quota.fraction,
                    quota.reset_time_ms,
                )
                .await?;
            wrote_any = true;

            // Image capacity is tracked but never lowers the aggregate.
            if route.group != Some(QuotaGroup::Image) {
                let lower = aggregate.is_none_or(|current| quota.fraction < current);
                if lower {
                    aggregate = Some(quota.fraction);
                    aggregate_reset = quota.reset_time_ms;
                }
            }
        }

        // No quota signal at all reads as empty, not full.
        let aggregate = if wrote_any { aggregate.unwrap_or(0.0) } else { 0.0 };
        self.store
            .set_aggregate_quota(account.id, aggregate, aggregate_reset)
            .await?;
        Ok(())
    }

    /// Email (userinfo) and tier (loadCodeAssist) sync.
    pub async fn sync_account_profile(
        &self,
        account: &AccountRow,
        cancel: &CancellationToken,
    ) -> UpstreamResult<()> {
        let Some(token) = account.access_token.clone() else {
            return Ok(());
        };

        let mut email = None;
        if account.email.is_none() {
            let (status, _, body) = self
                .upstream
                .get(
                    USERINFO_URL,
                    &[("Authorization", &format!("Bearer {token}"))],
                    cancel,
                )
                .await?;
            if (200..300).contains(&status)
                && let Ok(info) = serde_json::from_slice::<serde_json::Value>(&body)
            {
                email = info
                    .get("email")
                    .and_then(|e| e.as_str())
                    .map(|e| e.to_string());
            }
        }

        let mut tier = None;
        if let Ok(load) = self
            .upstream
            .rpc(
                "loadCodeAssist",
                &token,
                &client_metadata_body(),
                &crate::new_internal_request_id(),
                None,
                cancel,
            )
            .await
        {
            tier = load
                .get("currentTier")
                .and_then(|t| t.get("id"))
                .and_then(|t| t.as_str())
                .map(|t| t.to_string());
        }

        if email.is_some() || tier.is_some() {
            self.store
                .update_account_identity(account.id, email.as_deref(), tier.as_deref(), None)
                .await?;
        }
        Ok(())
    }
}

async fn do_refresh(
    store: Arc<SqliteStore>,
    upstream: Arc<UpstreamClient>,
    listener: Option<TokenListener>,
    account_id: i64,
) -> UpstreamResult<AccountRow> {
    let account = store.get_account(account_id).await?;
    let cancel = CancellationToken::new();

    let (status, body) = upstream
        .form_post(
            OAUTH_TOKEN_URL,
            &[
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
                ("refresh_token", &account.refresh_token),
                ("grant_type", "refresh_token"),
            ],
            &cancel,
        )
        .await?;

    let text = String::from_utf8_lossy(&body);
    if !(200..300).contains(&status) {
        if text.contains("invalid_grant") {
            tracing::warn!(account_id, "refresh token permanently invalid");
            store
                .set_account_status(
                    account_id,
                    STATUS_ERROR,
                    Some("refresh token permanently invalid"),
                )
                .await?;
            return Err(UpstreamError::Auth {
                message: "refresh token permanently invalid".to_string(),
                refresh_invalid: true,
            });
        }
        return Err(UpstreamError::Auth {
            message: format!("token refresh failed with status {status}"),
            refresh_invalid: false,
        });
    }

    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|err| UpstreamError::Auth {
            message: format!("token response parse failed: {err}"),
            refresh_invalid: false,
        })?;
    let access_token = parsed
        .get("access_token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| UpstreamError::Auth {
            message: "token response missing access_token".to_string(),
            refresh_invalid: false,
        })?;
    let expires_in = parsed
        .get("expires_in")
        .and_then(|e| e.as_i64())
        .unwrap_or(3600);
    let expires_at = now_ms() + expires_in * 1000;

    store
        .update_account_tokens(account_id, access_token, expires_at)
        .await?;
    tracing::debug!(account_id, "access token refreshed");

    if let Some(listener) = listener {
        listener(account_id, access_token.to_string());
    }
    store.get_account(account_id).await.map_err(Into::into)
}

fn client_metadata_body() -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "ideType": "ANTIGRAVITY",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    })
}

struct ModelQuota {
    fraction: f64,
    reset_time_ms: Option<i64>,
}

/// The catalog has shipped both map and array shapes; accept either.
fn iter_models(payload: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    let mut out = Vec::new();
    match payload.get("models") {
        Some(serde_json::Value::Object(map)) => {
            for (id, meta) in map {
                out.push((id.clone(), meta.clone()));
            }
        }
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                let id = item
                    .get("id")
                    .or_else(|| item.get("name"))
                    .and_then(|v| v.as_str());
                if let Some(id) = id {
                    let id = id.strip_prefix("models/").unwrap_or(id);
                    out.push((id.to_string(), item.clone()));
                }
            }
        }
        _ => {}
    }
    out
}

fn parse_quota(meta: &serde_json::Value) -> Option<ModelQuota> {
    let info = meta.get("quotaInfo").or_else(|| meta.get("quota"))?;
    let fraction = info
        .get("remainingFraction")
        .or_else(|| info.get("remaining"))
        .and_then(|f| f.as_f64())?;
    let reset_time_ms = info
        .get("resetTime")
        .and_then(parse_reset_time)
        .or_else(|| info.get("resetTimeMs").and_then(|v| v.as_i64()));
    Some(ModelQuota {
        fraction: fraction.clamp(0.0, 1.0),
        reset_time_ms,
    })
}

fn parse_reset_time(value: &serde_json::Value) -> Option<i64> {
    if let Some(ms) = value.as_i64() {
        return Some(ms);
    }
    let text = value.as_str()?;
    time::OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|ts| (ts.unix_timestamp_nanos() / 1_000_000) as i64)
}
