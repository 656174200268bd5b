//! Quota-aware account selection with sticky routing, per-account
//! concurrency locks, and capacity cooldowns.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use agpool_common::models::{ModelRoute, QuotaGroup, SelectionKey, threshold_setting_key};
use agpool_common::now_ms;
use agpool_storage::{AccountRow, CandidateRow, STATUS_ERROR, SqliteStore};

use crate::error::{UpstreamError, UpstreamResult, is_server_capacity_message,
    parse_reset_after_secs};
use crate::tokens::TokenManager;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent_per_account: i32,
    pub capacity_cooldown_default_ms: u64,
    pub capacity_cooldown_max_ms: u64,
    pub error_count_to_disable: u32,
    pub quota_threshold_default: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cooldown {
    until_ms: i64,
    consecutive: u32,
}

pub struct AccountPool {
    store: Arc<SqliteStore>,
    tokens: Arc<TokenManager>,
    cfg: PoolConfig,
    sticky: Mutex<HashMap<SelectionKey, i64>>,
    locks: Mutex<HashMap<i64, i32>>,
    cooldowns: Mutex<HashMap<(i64, SelectionKey), Cooldown>>,
    error_counts: Mutex<HashMap<i64, u32>>,
}

/// Holds one concurrency slot on an account; released on drop.
pub struct AccountLease {
    pool: Arc<AccountPool>,
    account_id: i64,
    released: bool,
}

impl AccountLease {
    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.unlock_account(self.account_id);
        }
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl AccountPool {
    pub fn new(store: Arc<SqliteStore>, tokens: Arc<TokenManager>, cfg: PoolConfig) -> Self {
        Self {
            store,
            tokens,
            cfg,
            sticky: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Select and lock the best eligible account for the route.
    pub async fn get_next_account(
        self: &Arc<Self>,
        route: &ModelRoute,
        exclude: &HashSet<i64>,
    ) -> UpstreamResult<(AccountRow, AccountLease)> {
        let key = route.selection_key.clone();
        let threshold = self.threshold_for(route.group).await;
        let now = now_ms();

        let candidates = self
            .store
            .active_accounts(key.join_model(), key.is_group(), 0.0)
            .await?;
        if candidates.is_empty() {
            return Err(UpstreamError::NoCapacity {
                message: "No active accounts available".to_string(),
                retry_after_ms: None,
            });
        }

        let mut above: Vec<&CandidateRow> = candidates
            .iter()
            .filter(|c| c.sel_quota_remaining > threshold)
            .collect();
        if above.is_empty() {
            let retry_after_ms = candidates
                .iter()
                .filter_map(|c| c.sel_quota_reset_time)
                .map(|reset| (reset - now).max(0) as u64)
                .min();
            let reset_secs = retry_after_ms.map(|ms| ms.div_ceil(1000)).unwrap_or(60);
            return Err(UpstreamError::NoCapacity {
                message: format!(
                    "No account above {:.0}% quota for {}, reset after {}s",
                    threshold * 100.0,
                    key,
                    reset_secs
                ),
                retry_after_ms,
            });
        }

        above.sort_by(|a, b| {
            b.sel_quota_remaining
                .partial_cmp(&a.sel_quota_remaining)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        // Sticky preference goes first while it stays eligible.
        let sticky_id = self.sticky.lock().unwrap().get(&key).copied();
        if let Some(sticky_id) = sticky_id {
            if let Some(pos) = above.iter().position(|c| c.id == sticky_id) {
                let preferred = above.remove(pos);
                above.insert(0, preferred);
            } else {
                self.sticky.lock().unwrap().remove(&key);
            }
        }

        let mut earliest_cooldown: Option<i64> = None;
        let mut considered_any = false;

        for candidate in above {
            if exclude.contains(&candidate.id) {
                continue;
            }
            if !self.try_lock_account(candidate.id) {
                continue;
            }
            if let Some(until) = self.cooldown_until(candidate.id, &key, now) {
                self.unlock_account(candidate.id);
                earliest_cooldown =
                    Some(earliest_cooldown.map_or(until, |current| current.min(until)));
                continue;
            }
            considered_any = true;

            let account = self.store.get_account(candidate.id).await?;
            match self.tokens.ensure_valid(&account).await {
                Ok(fresh) => {
                    let _ = self.store.touch_account_used(fresh.id, now).await;
                    let lease = AccountLease {
                        pool: self.clone(),
                        account_id: fresh.id,
                        released: false,
                    };
                    return Ok((fresh, lease));
                }
                Err(err) => {
                    self.unlock_account(candidate.id);
                    tracing::warn!(account_id = candidate.id, error = %err, "token refresh failed during selection");
                    if sticky_id == Some(candidate.id) {
                        self.sticky.lock().unwrap().remove(&key);
                    }
                    continue;
                }
            }
        }

        if !considered_any && let Some(until) = earliest_cooldown {
            let secs = (((until - now).max(0) as u64).div_ceil(1000)).saturating_sub(1);
            return Err(UpstreamError::NoCapacity {
                message: format!("No capacity available, reset after {secs}s"),
                retry_after_ms: Some((until - now).max(0) as u64),
            });
        }
        Err(UpstreamError::NoCapacity {
            message: "No available accounts with valid tokens".to_string(),
            retry_after_ms: None,
        })
    }

    /// Eligible-account count used to bound cross-account switches.
    pub async fn available_count(&self, route: &ModelRoute) -> usize {
        let key = &route.selection_key;
        let threshold = self.threshold_for(route.group).await;
        let now = now_ms();
        let Ok(candidates) = self
            .store
            .active_accounts(key.join_model(), key.is_group(), 0.0)
            .await
        else {
            return 0;
        };
        candidates
            .iter()
            .filter(|c| c.sel_quota_remaining > threshold)
            .filter(|c| self.cooldown_until(c.id, key, now).is_none())
            .count()
    }

    pub fn unlock_account(&self, account_id: i64) {
        if self.cfg.max_concurrent_per_account <= 0 {
            return;
        }
        let mut locks = self.locks.lock().unwrap();
        if let Some(count) = locks.get_mut(&account_id) {
            *count -= 1;
            if *count <= 0 {
                locks.remove(&account_id);
            }
        }
    }

    fn try_lock_account(&self, account_id: i64) -> bool {
        if self.cfg.max_concurrent_per_account <= 0 {
            return true;
        }
        let mut locks = self.locks.lock().unwrap();
        let count = locks.entry(account_id).or_insert(0);
        if *count >= self.cfg.max_concurrent_per_account {
            return false;
        }
        *count += 1;
        true
    }

    /// Success: reset error counting, pin stickiness, clear the cooldown
    /// streak for this key.
    pub fn mark_account_success(&self, account_id: i64, key: &SelectionKey) {
        self.error_counts.lock().unwrap().remove(&account_id);
        self.sticky.lock().unwrap().insert(key.clone(), account_id);
        self.mark_capacity_recovered(account_id, key);
    }

    /// Non-capacity error: count it, and park the account at the threshold.
    pub async fn mark_account_error(&self, account_id: i64, error: &str) {
        let count = {
            let mut counts = self.error_counts.lock().unwrap();
            let count = counts.entry(account_id).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.cfg.error_count_to_disable {
            tracing::warn!(account_id, count, "error threshold reached, marking account");
            self.error_counts.lock().unwrap().remove(&account_id);
            self.sticky.lock().unwrap().retain(|_, id| *id != account_id);
            if let Err(err) = self
                .store
                .set_account_status(account_id, STATUS_ERROR, Some(error))
                .await
            {
                tracing::warn!(account_id, error = %err, "status write failed");
            }
        }
        let _ = self.store.set_account_error_count(account_id, count as i32).await;
    }

    /// Capacity error on (account, key): exponential cooldown unless the
    /// message carries its own reset hint. Server-wide saturation is never
    /// cooled, switching accounts would not help.
    pub fn mark_capacity_limited(&self, account_id: i64, key: &SelectionKey, message: &str) {
        if is_server_capacity_message(message) {
            return;
        }
        let mut cooldowns = self.cooldowns.lock().unwrap();
        let entry = cooldowns
            .entry((account_id, key.clone()))
            .or_insert_with(Cooldown::default);
        entry.consecutive += 1;
        let duration_ms = match parse_reset_after_secs(message) {
            Some(secs) => (secs + 1) * 1000,
            None => {
                let shift = entry.consecutive.saturating_sub(1).min(16);
                (self.cfg.capacity_cooldown_default_ms << shift)
                    .min(self.cfg.capacity_cooldown_max_ms)
            }
        };
        entry.until_ms = now_ms() + duration_ms as i64;
        tracing::info!(
            account_id,
            selection_key = %key,
            cooldown_ms = duration_ms,
            streak = entry.consecutive,
            "capacity cooldown set"
        );
        let mut sticky = self.sticky.lock().unwrap();
        if sticky.get(key) == Some(&account_id) {
            sticky.remove(key);
        }
    }

    pub fn mark_capacity_recovered(&self, account_id: i64, key: &SelectionKey) {
        self.cooldowns
            .lock()
            .unwrap()
            .remove(&(account_id, key.clone()));
    }

    fn cooldown_until(&self, account_id: i64, key: &SelectionKey, now: i64) -> Option<i64> {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        let entry = cooldowns.get(&(account_id, key.clone()))?;
        if entry.until_ms > now {
            Some(entry.until_ms)
        } else {
            // Expired: idle again, but keep the streak until a success.
            let streak = entry.consecutive;
            cooldowns.insert(
                (account_id, key.clone()),
                Cooldown {
                    until_ms: 0,
                    consecutive: streak,
                },
            );
            None
        }
    }

    async fn threshold_for(&self, group: Option<QuotaGroup>) -> f64 {
        let Some(group) = group else {
            return self.cfg.quota_threshold_default;
        };
        match self.store.get_setting(&threshold_setting_key(group)).await {
            Ok(Some(value)) => value
                .trim()
                .parse()
                .unwrap_or(self.cfg.quota_threshold_default),
            _ => self.cfg.quota_threshold_default,
        }
    }

    /// Admin view of routing state per group.
    pub async fn group_routing_overview(&self) -> serde_json::Value {
        let now = now_ms();
        let mut groups = serde_json::Map::new();
        for group in QuotaGroup::all() {
            let key = SelectionKey::Group(group);
            let threshold = self.threshold_for(Some(group)).await;
            let candidates = self
                .store
                .active_accounts(key.join_model(), true, 0.0)
                .await
                .unwrap_or_default();
            let sticky = self.sticky.lock().unwrap().get(&key).copied();
            let accounts: Vec<serde_json::Value> = candidates
                .iter()
                .map(|c| {
                    let cooldown = {
                        let cooldowns = self.cooldowns.lock().unwrap();
                        cooldowns
                            .get(&(c.id, key.clone()))
                            .filter(|cd| cd.until_ms > now)
                            .map(|cd| cd.until_ms)
                    };
                    serde_json::json!({
                        "id": c.id,
                        "email": c.email,
                        "quota_remaining": c.sel_quota_remaining,
                        "quota_reset_time": c.sel_quota_reset_time,
                        "in_flight": self.locks.lock().unwrap().get(&c.id).copied().unwrap_or(0),
                        "cooldown_until": cooldown,
                        "eligible": c.sel_quota_remaining > threshold && cooldown.is_none(),
                    })
                })
                .collect();
            groups.insert(
                group.as_str().to_string(),
                serde_json::json!({
                    "threshold": threshold,
                    "sticky_account_id": sticky,
                    "accounts": accounts,
                }),
            );
        }
        serde_json::Value::Object(groups)
    }
}
