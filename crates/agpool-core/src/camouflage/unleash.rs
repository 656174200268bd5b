//! Feature-flag chatter: register / features / metrics on the official
//! client's cadence, with a stable per-account connection identity and an
//! ETag cache for conditional feature fetches.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use agpool_common::now_ms;

use crate::upstream::UpstreamClient;

const UNLEASH_BASE: &str = "https://flags.antigravity.google/api/frontend";
const POLL_INTERVAL: Duration = Duration::from_secs(60);
const POLL_JITTER_SECS: i64 = 5;
const APP_NAME: &str = "antigravity";

pub async fn run(
    upstream: Arc<UpstreamClient>,
    account_id: i64,
    token: Arc<ArcSwap<String>>,
    cancel: CancellationToken,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let started = now_ms();
    let mut etag: Option<String> = None;
    let mut registered = false;

    loop {
        let jitter: i64 = rand::rng().random_range(-POLL_JITTER_SECS..=POLL_JITTER_SECS);
        let tick = POLL_INTERVAL.as_secs() as i64 + jitter;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(tick.max(1) as u64)) => {}
            _ = cancel.cancelled() => return,
        }
        let access = token.load().as_ref().clone();
        let auth = format!("Bearer {access}");

        if !registered {
            let body = serde_json::json!({
                "appName": APP_NAME,
                "instanceId": connection_id,
                "connectionId": connection_id,
                "started": started,
                "interval": POLL_INTERVAL.as_millis() as u64,
            });
            match upstream
                .post_json(
                    &format!("{UNLEASH_BASE}/client/register"),
                    &[("Authorization", auth.as_str())],
                    &body,
                    &cancel,
                )
                .await
            {
                Ok((status, _)) if (200..300).contains(&status) => registered = true,
                Ok((status, _)) => {
                    tracing::debug!(account_id, status, "unleash register rejected")
                }
                Err(err) => tracing::debug!(account_id, error = %err, "unleash register failed"),
            }
        }

        let mut headers: Vec<(&str, &str)> = vec![("Authorization", auth.as_str())];
        if let Some(tag) = etag.as_deref() {
            headers.push(("If-None-Match", tag));
        }
        match upstream.get(UNLEASH_BASE, &headers, &cancel).await {
            Ok((status, resp_headers, _)) => {
                if status == 200
                    && let Some((_, tag)) = resp_headers
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case("etag"))
                {
                    etag = Some(tag.clone());
                }
                // 304 keeps the cached tag.
            }
            Err(err) => tracing::debug!(account_id, error = %err, "unleash features failed"),
        }

        let metrics = serde_json::json!({
            "appName": APP_NAME,
            "connectionId": connection_id,
            "bucket": {
                "start": now_ms() - POLL_INTERVAL.as_millis() as i64,
                "stop": now_ms(),
                "toggles": {},
            }
        });
        if let Err(err) = upstream
            .post_json(
                &format!("{UNLEASH_BASE}/client/metrics"),
                &[("Authorization", auth.as_str())],
                &metrics,
                &cancel,
            )
            .await
        {
            tracing::debug!(account_id, error = %err, "unleash metrics failed");
        }
    }
}
