//! Background traffic that keeps each credential looking like the official
//! client: warmup, heartbeat, telemetry, trajectory, feature flags, and the
//! version fetcher. Failures are logged at debug and never surface.

mod trajectory;
mod unleash;
mod version;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use agpool_common::models::ModelRoute;
use agpool_common::now_ms;
use agpool_protocol::upstream::trajectory_id;
use agpool_storage::AccountRow;

use crate::upstream::UpstreamClient;

pub use version::VersionFetcher;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
const HEARTBEAT_JITTER_MS: u64 = 50;
/// Heartbeats pause after this much silence; the timer keeps running so
/// traffic resumes them promptly.
const IDLE_GATE: Duration = Duration::from_secs(180);

struct AccountTask {
    cancel: CancellationToken,
    token: Arc<ArcSwap<String>>,
}

pub struct Camouflage {
    upstream: Arc<UpstreamClient>,
    root: CancellationToken,
    accounts: Mutex<HashMap<i64, AccountTask>>,
    last_traffic: Arc<Mutex<HashMap<i64, i64>>>,
}

impl Camouflage {
    pub fn new(upstream: Arc<UpstreamClient>, root: CancellationToken) -> Self {
        Self {
            upstream,
            root,
            accounts: Mutex::new(HashMap::new()),
            last_traffic: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start (or refresh) the per-account schedulers.
    pub fn start_account(self: &Arc<Self>, account: &AccountRow) {
        let Some(access_token) = account.access_token.clone() else {
            return;
        };
        {
            let accounts = self.accounts.lock().unwrap();
            if let Some(task) = accounts.get(&account.id) {
                task.token.store(Arc::new(access_token));
                return;
            }
        }

        let token = Arc::new(ArcSwap::from_pointee(access_token));
        let cancel = self.root.child_token();
        self.accounts.lock().unwrap().insert(
            account.id,
            AccountTask {
                cancel: cancel.clone(),
                token: token.clone(),
            },
        );

        // Warmup once, then the heartbeat cadence.
        let this = self.clone();
        let account_id = account.id;
        let heartbeat_token = token.clone();
        let heartbeat_cancel = cancel.clone();
        tokio::spawn(async move {
            this.run_warmup(heartbeat_token.clone(), &heartbeat_cancel)
                .await;
            this.run_heartbeat(account_id, heartbeat_token, heartbeat_cancel)
                .await;
        });

        let upstream = self.upstream.clone();
        tokio::spawn(unleash::run(upstream, account.id, token, cancel));
    }

    /// Hot-swap the token after a refresh; the timer never restarts.
    pub fn update_heartbeat_account(&self, account_id: i64, access_token: &str) {
        if let Some(task) = self.accounts.lock().unwrap().get(&account_id) {
            task.token.store(Arc::new(access_token.to_string()));
        }
    }

    pub fn stop_account(&self, account_id: i64) {
        if let Some(task) = self.accounts.lock().unwrap().remove(&account_id) {
            task.cancel.cancel();
        }
        self.last_traffic.lock().unwrap().remove(&account_id);
    }

    pub fn shutdown(&self) {
        let mut accounts = self.accounts.lock().unwrap();
        for (_, task) in accounts.drain() {
            task.cancel.cancel();
        }
    }

    /// Per-request chatter: telemetry and trajectory posts mirroring the
    /// official client, keyed to the real request id.
    pub fn report_request(self: &Arc<Self>, account: &AccountRow, request_id: &str, route: &ModelRoute) {
        self.note_traffic(account.id);
        let Some(token) = account.access_token.clone() else {
            return;
        };
        let trajectory = trajectory_id(request_id).unwrap_or_default().to_string();
        let model = route.upstream_model.clone();
        let project = account.project_id.clone().unwrap_or_default();
        let upstream = self.upstream.clone();
        let cancel = self.root.child_token();

        tokio::spawn(async move {
            let telemetry = serde_json::json!({
                "project": project,
                "metrics": [{
                    "conversationOffered": {
                        "trajectoryId": trajectory,
                        "timestampMs": now_ms(),
                    }
                }]
            });
            upstream
                .fire_rpc("recordCodeAssistMetrics", &token, &telemetry, &cancel)
                .await;

            let payload = trajectory::build(&trajectory, &model, &project);
            upstream
                .fire_rpc("recordTrajectory", &token, &payload, &cancel)
                .await;
        });
    }

    pub fn note_traffic(&self, account_id: i64) {
        self.last_traffic
            .lock()
            .unwrap()
            .insert(account_id, now_ms());
    }

    fn is_idle(&self, account_id: i64) -> bool {
        let last = self
            .last_traffic
            .lock()
            .unwrap()
            .get(&account_id)
            .copied();
        match last {
            Some(last) => now_ms() - last > IDLE_GATE.as_millis() as i64,
            None => true,
        }
    }

    /// Four init RPCs with human-scale jitter between them.
    async fn run_warmup(&self, token: Arc<ArcSwap<String>>, cancel: &CancellationToken) {
        let calls: [(&str, serde_json::Value); 4] = [
            ("onboardUser", metadata_body()),
            ("fetchAvailableModels", serde_json::json!({})),
            ("loadCodeAssist", metadata_body()),
            (
                "recordCodeAssistMetrics",
                serde_json::json!({ "metrics": [] }),
            ),
        ];
        for (rpc, body) in calls {
            if cancel.is_cancelled() {
                return;
            }
            let access = token.load().as_ref().clone();
            self.upstream.fire_rpc(rpc, &access, &body, cancel).await;
            let jitter = rand::rng().random_range(50..=200);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    /// One no-op metrics POST per second, suspended while idle.
    async fn run_heartbeat(
        &self,
        account_id: i64,
        token: Arc<ArcSwap<String>>,
        cancel: CancellationToken,
    ) {
        loop {
            let jitter: i64 =
                rand::rng().random_range(-(HEARTBEAT_JITTER_MS as i64)..=HEARTBEAT_JITTER_MS as i64);
            let tick = HEARTBEAT_INTERVAL.as_millis() as i64 + jitter;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(tick.max(1) as u64)) => {}
                _ = cancel.cancelled() => return,
            }
            if self.is_idle(account_id) {
                continue;
            }
            let access = token.load().as_ref().clone();
            let body = serde_json::json!({ "metrics": [] });
            self.upstream
                .fire_rpc("recordCodeAssistMetrics", &access, &body, &cancel)
                .await;
        }
    }
}

pub(crate) fn metadata_body() -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "ideType": "ANTIGRAVITY",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    })
}
