use agpool_storage::{AttemptInsert, NewAccount, SqliteStore};

async fn open_store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agpool.db");
    let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
    store.sync().await.unwrap();
    (store, dir)
}

fn account(refresh: &str) -> NewAccount {
    NewAccount {
        refresh_token: refresh.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn group_join_excludes_accounts_without_quota_rows() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    let b = store.insert_account(account("r2")).await.unwrap();

    store
        .upsert_model_quota(a.id, "gemini-2.5-flash", 0.8, None)
        .await
        .unwrap();
    // b has no quota row for the representative model.

    let rows = store
        .active_accounts("gemini-2.5-flash", true, 0.0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, a.id);
    assert_eq!(rows[0].sel_quota_remaining, 0.8);

    // Raw-model selection falls back to the aggregate (1.0 at insert).
    let rows = store
        .active_accounts("gemini-2.5-flash", false, 0.0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert!(ids.contains(&b.id));
}

#[tokio::test]
async fn selection_orders_by_quota_then_last_used() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    let b = store.insert_account(account("r2")).await.unwrap();
    let c = store.insert_account(account("r3")).await.unwrap();

    for (id, quota) in [(a.id, 0.5), (b.id, 0.9), (c.id, 0.9)] {
        store
            .upsert_model_quota(id, "gemini-2.5-pro", quota, None)
            .await
            .unwrap();
    }
    // c used more recently than b, so b wins the tie.
    store.touch_account_used(b.id, 100).await.unwrap();
    store.touch_account_used(c.id, 200).await.unwrap();

    let rows = store
        .active_accounts("gemini-2.5-pro", true, 0.0)
        .await
        .unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![b.id, c.id, a.id]);
}

#[tokio::test]
async fn min_quota_filters_rows() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    store
        .upsert_model_quota(a.id, "claude-sonnet-4-6", 0.1, Some(9_000))
        .await
        .unwrap();

    let rows = store
        .active_accounts("claude-sonnet-4-6", true, 0.2)
        .await
        .unwrap();
    assert!(rows.is_empty());

    let rows = store
        .active_accounts("claude-sonnet-4-6", true, 0.0)
        .await
        .unwrap();
    assert_eq!(rows[0].sel_quota_reset_time, Some(9_000));
}

#[tokio::test]
async fn inactive_accounts_never_selected() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    store
        .upsert_model_quota(a.id, "gemini-2.5-flash", 1.0, None)
        .await
        .unwrap();
    store
        .set_account_status(a.id, agpool_storage::STATUS_ERROR, Some("boom"))
        .await
        .unwrap();

    let rows = store
        .active_accounts("gemini-2.5-flash", true, 0.0)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn delete_account_nulls_attempts_and_drops_quotas() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    store
        .upsert_model_quota(a.id, "gemini-2.5-flash", 0.7, None)
        .await
        .unwrap();
    store
        .insert_attempt(AttemptInsert {
            request_id: "agent/1/u/0".to_string(),
            account_id: Some(a.id),
            model: "gemini-2.5-flash".to_string(),
            attempt_no: 1,
            account_attempt: 1,
            same_retry: 0,
            status: "success".to_string(),
            latency_ms: Some(120),
            error_message: None,
            started_at: 1,
        })
        .await
        .unwrap();

    store.delete_account(a.id).await.unwrap();

    let attempts = store.attempts_for_request("agent/1/u/0").await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].account_id, None);
    assert!(store.model_quotas(a.id).await.unwrap().is_empty());
    assert!(store.get_account(a.id).await.is_err());
}

#[tokio::test]
async fn model_quota_upsert_replaces_row() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    store
        .upsert_model_quota(a.id, "gemini-2.5-pro", 0.9, None)
        .await
        .unwrap();
    store
        .upsert_model_quota(a.id, "gemini-2.5-pro", 0.4, Some(5_000))
        .await
        .unwrap();

    let rows = store.model_quotas(a.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].quota_remaining, 0.4);
    assert_eq!(rows[0].quota_reset_time, Some(5_000));
}

#[tokio::test]
async fn quota_values_are_clamped() {
    let (store, _dir) = open_store().await;
    let a = store.insert_account(account("r1")).await.unwrap();
    store
        .upsert_model_quota(a.id, "gemini-2.5-pro", 1.7, None)
        .await
        .unwrap();
    store.set_aggregate_quota(a.id, -0.2, None).await.unwrap();

    let rows = store.model_quotas(a.id).await.unwrap();
    assert_eq!(rows[0].quota_remaining, 1.0);
    assert_eq!(store.get_account(a.id).await.unwrap().quota_remaining, 0.0);
}

#[tokio::test]
async fn settings_round_trip() {
    let (store, _dir) = open_store().await;
    assert!(store.get_setting("quota_threshold:pro").await.unwrap().is_none());
    store.put_setting("quota_threshold:pro", "0.35").await.unwrap();
    store.put_setting("quota_threshold:pro", "0.5").await.unwrap();
    assert_eq!(
        store.get_setting("quota_threshold:pro").await.unwrap().as_deref(),
        Some("0.5")
    );
}

#[tokio::test]
async fn signature_cache_persists_and_sweeps() {
    let (store, _dir) = open_store().await;
    store
        .put_signature("claude_tool_thinking:toolu_1", "sig", Some("thought"), 1_000)
        .await
        .unwrap();
    store
        .put_signature("tool_thought_signature:call_2", "sig2", None, 5_000)
        .await
        .unwrap();

    let swept = store.sweep_signatures_before(2_000).await.unwrap();
    assert_eq!(swept, 1);
    let rows = store.load_signatures().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, "tool_thought_signature:call_2");
}
