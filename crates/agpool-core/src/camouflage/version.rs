//! Hourly client-version polling with a reactive, debounced nudge when the
//! upstream complains about an outdated version.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use agpool_common::now_ms;

use crate::upstream::UpstreamClient;

const UPDATER_URL: &str = "https://dl.google.com/antigravity/latest/version.json";
const POLL_INTERVAL: Duration = Duration::from_secs(3600);
const NUDGE_DEBOUNCE_MS: i64 = 30_000;

pub struct VersionFetcher {
    upstream: Arc<UpstreamClient>,
    nudge: Notify,
    last_nudge_ms: Mutex<i64>,
}

impl VersionFetcher {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self {
            upstream,
            nudge: Notify::new(),
            last_nudge_ms: Mutex::new(0),
        }
    }

    /// Reactive trigger (e.g. the upstream returned a version-outdated
    /// message), debounced to one check per 30 s.
    pub fn nudge(&self) {
        let mut last = self.last_nudge_ms.lock().unwrap();
        let now = now_ms();
        if now - *last < NUDGE_DEBOUNCE_MS {
            return;
        }
        *last = now;
        self.nudge.notify_one();
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.check_once(&cancel).await;
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.nudge.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn check_once(&self, cancel: &CancellationToken) {
        match self.upstream.get(UPDATER_URL, &[], cancel).await {
            Ok((status, _, body)) if (200..300).contains(&status) => {
                if let Some(version) = parse_version(&body) {
                    self.upstream.set_client_version(&version);
                }
            }
            Ok((status, _, _)) => tracing::debug!(status, "version check rejected"),
            Err(err) => tracing::debug!(error = %err, "version check failed"),
        }
    }
}

/// `{"version": "1.16.2"}` or a bare version string.
fn parse_version(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(version) = value.get("version").and_then(|v| v.as_str())
    {
        return Some(version.to_string());
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    (!trimmed.is_empty()
        && trimmed.len() < 32
        && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.'))
    .then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_json_and_bare_forms() {
        assert_eq!(
            parse_version(br#"{"version":"1.16.2"}"#),
            Some("1.16.2".to_string())
        );
        assert_eq!(parse_version(b"1.17.0\n"), Some("1.17.0".to_string()));
        assert_eq!(parse_version(b"<html>nope</html>"), None);
    }
}
