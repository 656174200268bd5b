use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use agpool_common::AppConfig;
use agpool_core::{
    AccountPool, Camouflage, Gateway, PoolConfig, RetryPolicy, SignatureCache, TokenManager,
    UpstreamClient, VersionFetcher,
};
use agpool_router::AppState;
use agpool_storage::SqliteStore;
use agpool_translate::TranslateOptions;
use agpool_transport::FingerprintTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Arc::new(AppConfig::from_env().context("invalid configuration")?);

    let store = Arc::new(
        SqliteStore::connect(&cfg.db_path)
            .await
            .context("database connect failed")?,
    );
    store.sync().await.context("schema sync failed")?;

    let transport = Arc::new(FingerprintTransport::new(
        cfg.use_tls_fingerprint,
        &cfg.helper_path,
        &cfg.tls_config_path,
        cfg.outbound_proxy.clone(),
    ));
    let upstream = Arc::new(UpstreamClient::new(transport, &cfg));

    let root_cancel = CancellationToken::new();
    let tokens = Arc::new(TokenManager::new(store.clone(), upstream.clone()));
    let camouflage = Arc::new(Camouflage::new(upstream.clone(), root_cancel.clone()));

    // Heartbeats hot-swap their token on every refresh.
    let camouflage_for_tokens = camouflage.clone();
    tokens.set_token_listener(Arc::new(move |account_id, access_token| {
        camouflage_for_tokens.update_heartbeat_account(account_id, &access_token);
    }));

    let pool = Arc::new(AccountPool::new(
        store.clone(),
        tokens.clone(),
        PoolConfig::from_config(&cfg),
    ));
    let signatures = Arc::new(SignatureCache::new(
        cfg.claude_thinking_signature_ttl_ms,
        Some(store.clone()),
    ));
    signatures.load_persisted().await;

    let gateway = Arc::new(Gateway {
        store: store.clone(),
        pool: pool.clone(),
        tokens: tokens.clone(),
        upstream: upstream.clone(),
        camouflage: camouflage.clone(),
        policy: RetryPolicy::from_config(&cfg),
    });

    let version = Arc::new(VersionFetcher::new(upstream.clone()));
    tokio::spawn(version.clone().run(root_cancel.clone()));
    tokio::spawn(agpool_core::maintenance::run_sweeper(
        store.clone(),
        cfg.claude_thinking_signature_ttl_ms,
        root_cancel.clone(),
    ));

    // Resume camouflage for accounts that were active before the restart.
    for account in store.list_accounts().await? {
        if account.status == agpool_storage::STATUS_ACTIVE && account.access_token.is_some() {
            camouflage.start_account(&account);
        }
    }

    let state = AppState {
        cfg: cfg.clone(),
        store,
        gateway,
        signatures,
        translate_opts: Arc::new(TranslateOptions::from_config(&cfg)),
        camouflage: camouflage.clone(),
        version,
        tokens,
        pool,
    };
    let app = agpool_router::router(state);

    let bind = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "agpool listening");

    let shutdown_cancel = root_cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            shutdown_cancel.cancel();
        })
        .await
        .context("server error")?;

    camouflage.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).expect("signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
