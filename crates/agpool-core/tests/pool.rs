use std::collections::HashSet;
use std::sync::Arc;

use agpool_common::AppConfig;
use agpool_common::models::resolve_model;
use agpool_common::now_ms;
use agpool_core::{AccountPool, PoolConfig, TokenManager, UpstreamClient, UpstreamError};
use agpool_storage::{NewAccount, SqliteStore};
use agpool_transport::WreqTransport;

struct Fixture {
    store: Arc<SqliteStore>,
    pool: Arc<AccountPool>,
    _dir: tempfile::TempDir,
}

async fn fixture(pool_cfg: PoolConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.db");
    let store = Arc::new(SqliteStore::connect(path.to_str().unwrap()).await.unwrap());
    store.sync().await.unwrap();

    let cfg = AppConfig::default();
    let upstream = Arc::new(UpstreamClient::new(
        Arc::new(WreqTransport::new(None)),
        &cfg,
    ));
    let tokens = Arc::new(TokenManager::new(store.clone(), upstream));
    let pool = Arc::new(AccountPool::new(store.clone(), tokens, pool_cfg));
    Fixture {
        store,
        pool,
        _dir: dir,
    }
}

fn default_cfg() -> PoolConfig {
    PoolConfig {
        max_concurrent_per_account: 2,
        capacity_cooldown_default_ms: 30_000,
        capacity_cooldown_max_ms: 900_000,
        error_count_to_disable: 3,
        quota_threshold_default: 0.2,
    }
}

/// Account with a token that will not need refreshing.
async fn seed_account(store: &SqliteStore, quota: f64) -> i64 {
    let account = store
        .insert_account(NewAccount {
            refresh_token: format!("rt-{quota}"),
            access_token: Some("tok".to_string()),
            token_expires_at: Some(now_ms() + 3_600_000),
            project_id: Some("proj".to_string()),
            session_id: Some("-123".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .upsert_model_quota(account.id, "gemini-2.5-flash", quota, None)
        .await
        .unwrap();
    account.id
}

#[tokio::test]
async fn selection_prefers_highest_quota() {
    let fx = fixture(default_cfg()).await;
    let low = seed_account(&fx.store, 0.4).await;
    let high = seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    let (account, lease) = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(account.id, high);
    assert_ne!(account.id, low);
    lease.release();
}

#[tokio::test]
async fn stickiness_survives_while_eligible() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;
    let b = seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    // Make b the sticky pick despite equal quota.
    fx.pool.mark_account_success(b, &route.selection_key);
    let (account, lease) = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(account.id, b);
    lease.release();

    // Sticky account drops below threshold: preference clears.
    fx.store
        .upsert_model_quota(b, "gemini-2.5-flash", 0.1, None)
        .await
        .unwrap();
    let (account, lease) = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(account.id, a);
    lease.release();
}

#[tokio::test]
async fn concurrency_limit_bounds_in_flight_leases() {
    let fx = fixture(default_cfg()).await;
    let only = seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    let (_, lease1) = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap();
    let (_, lease2) = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap();
    // Third concurrent call: the only account is at its limit of 2.
    let err = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::NoCapacity { .. }));

    lease1.release();
    let (account, lease3) = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(account.id, only);
    lease3.release();
    lease2.release();
}

#[tokio::test]
async fn zero_limit_disables_locking() {
    let fx = fixture(PoolConfig {
        max_concurrent_per_account: 0,
        ..default_cfg()
    })
    .await;
    seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    let mut leases = Vec::new();
    for _ in 0..5 {
        let (_, lease) = fx
            .pool
            .get_next_account(&route, &HashSet::new())
            .await
            .unwrap();
        leases.push(lease);
    }
}

#[tokio::test]
async fn below_threshold_yields_429_with_reset() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;
    fx.store
        .upsert_model_quota(a, "gemini-2.5-flash", 0.05, Some(now_ms() + 30_000))
        .await
        .unwrap();
    let route = resolve_model("gemini-2.5-flash");

    let err = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap_err();
    let UpstreamError::NoCapacity {
        message,
        retry_after_ms,
    } = err
    else {
        panic!("expected NoCapacity");
    };
    assert!(message.contains("No account above 20% quota for group:flash"));
    assert!(retry_after_ms.unwrap() <= 30_000);
}

#[tokio::test]
async fn reset_hint_cooldown_blocks_redispatch() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    fx.pool.mark_capacity_limited(
        a,
        &route.selection_key,
        "Resource has been exhausted, reset after 7s",
    );
    let err = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap_err();
    let UpstreamError::NoCapacity {
        message,
        retry_after_ms,
    } = err
    else {
        panic!("expected NoCapacity");
    };
    assert!(message.contains("No capacity available"));
    // (7+1)s cooldown window.
    let retry = retry_after_ms.unwrap();
    assert!(retry > 6_000 && retry <= 8_000, "retry_after {retry}");

    // Recovery clears it.
    fx.pool.mark_capacity_recovered(a, &route.selection_key);
    assert!(fx.pool.get_next_account(&route, &HashSet::new()).await.is_ok());
}

#[tokio::test]
async fn server_capacity_errors_do_not_cool_down() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    fx.pool
        .mark_capacity_limited(a, &route.selection_key, "Server capacity exhausted");
    assert!(fx.pool.get_next_account(&route, &HashSet::new()).await.is_ok());
}

#[tokio::test]
async fn excluded_accounts_are_skipped() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;
    let b = seed_account(&fx.store, 0.5).await;
    let route = resolve_model("gemini-2.5-flash");

    let mut exclude = HashSet::new();
    exclude.insert(a);
    let (account, lease) = fx.pool.get_next_account(&route, &exclude).await.unwrap();
    assert_eq!(account.id, b);
    lease.release();

    exclude.insert(b);
    let err = fx.pool.get_next_account(&route, &exclude).await.unwrap_err();
    // All candidates excluded (not cooling): the token-less flavour of the
    // pool error, not the cooldown one.
    assert!(err.to_string().contains("No available accounts with valid tokens"));
}

#[tokio::test]
async fn repeated_errors_mark_the_account() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;

    for _ in 0..3 {
        fx.pool.mark_account_error(a, "boom").await;
    }
    let row = fx.store.get_account(a).await.unwrap();
    assert_eq!(row.status, agpool_storage::STATUS_ERROR);

    let route = resolve_model("gemini-2.5-flash");
    let err = fx
        .pool
        .get_next_account(&route, &HashSet::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No active accounts available"));
}

#[tokio::test]
async fn success_resets_error_streak() {
    let fx = fixture(default_cfg()).await;
    let a = seed_account(&fx.store, 0.9).await;
    let route = resolve_model("gemini-2.5-flash");

    fx.pool.mark_account_error(a, "boom").await;
    fx.pool.mark_account_error(a, "boom").await;
    fx.pool.mark_account_success(a, &route.selection_key);
    fx.pool.mark_account_error(a, "boom").await;

    let row = fx.store.get_account(a).await.unwrap();
    assert_eq!(row.status, agpool_storage::STATUS_ACTIVE);
}
