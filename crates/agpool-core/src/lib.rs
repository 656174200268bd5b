//! agpool core: account pool, token manager, signature cache, retry
//! orchestration, and the camouflage schedulers.

pub mod camouflage;
pub mod error;
pub mod gateway;
pub mod maintenance;
pub mod pool;
pub mod retry;
pub mod signatures;
pub mod tokens;
pub mod upstream;

pub use camouflage::{Camouflage, VersionFetcher};
pub use error::{UpstreamError, UpstreamResult, classify_http, parse_reset_after_secs};
pub use gateway::{Gateway, GenerateOutcome};
pub use pool::{AccountLease, AccountPool, PoolConfig};
pub use retry::RetryPolicy;
pub use signatures::SignatureCache;
pub use tokens::{TokenManager, TokenListener};
pub use upstream::UpstreamClient;

use agpool_common::now_ms;

/// Request id for internal (non-chat) upstream calls; same shape as the
/// chat path so headers stay uniform.
pub fn new_internal_request_id() -> String {
    agpool_protocol::upstream::new_request_id(now_ms())
}

use agpool_common::AppConfig;

impl PoolConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_concurrent_per_account: cfg.max_concurrent_per_account,
            capacity_cooldown_default_ms: cfg.capacity_cooldown_default_ms,
            capacity_cooldown_max_ms: cfg.capacity_cooldown_max_ms,
            error_count_to_disable: cfg.error_count_to_disable,
            quota_threshold_default: cfg.quota_threshold_default,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            same_account_retries: cfg.same_account_retries,
            same_account_retry_delay: std::time::Duration::from_millis(
                cfg.same_account_retry_delay_ms,
            ),
            capacity_retry_delay: std::time::Duration::from_millis(
                cfg.upstream_capacity_retry_delay_ms,
            ),
            total_timeout: std::time::Duration::from_millis(cfg.retry_total_timeout_ms),
            max_capacity_retries: 2,
        }
    }
}

/// Synthetic per-account device identity minted at account creation.
pub fn new_device_identity() -> (String, String, String) {
    use rand::Rng;
    let mut rng = rand::rng();
    let instance_id = format!("DESKTOP-{:07X}", rng.random_range(0x100000..0xFFFFFFu64));
    let device_fingerprint = format!("{:032x}", rng.random::<u128>());
    let session_id = format!("-{}", rng.random_range(1_000_000_000_000u64..9_000_000_000_000u64));
    (instance_id, device_fingerprint, session_id)
}
