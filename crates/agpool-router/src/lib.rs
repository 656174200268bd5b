//! Ingress: dialect routes, downstream auth, SSE framing, and the admin
//! JSON API.

mod admin;
mod auth;
mod error_body;
mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use agpool_common::AppConfig;
use agpool_core::{AccountPool, Camouflage, Gateway, SignatureCache, TokenManager, VersionFetcher};
use agpool_storage::SqliteStore;
use agpool_translate::TranslateOptions;

pub use error_body::Dialect;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<Gateway>,
    pub signatures: Arc<SignatureCache>,
    pub translate_opts: Arc<TranslateOptions>,
    pub camouflage: Arc<Camouflage>,
    pub version: Arc<VersionFetcher>,
    pub tokens: Arc<TokenManager>,
    pub pool: Arc<AccountPool>,
}

pub fn router(state: AppState) -> Router {
    let proxied = Router::new()
        .route("/v1/chat/completions", post(proxy::openai_chat))
        .route("/v1/messages", post(proxy::claude_messages))
        .route("/v1/messages/count_tokens", post(proxy::claude_count_tokens))
        .route("/v1/models", get(proxy::models_list))
        .route("/v1/models/{model}", get(proxy::models_get))
        .route("/v1beta/models", get(proxy::gemini_models_list))
        .route(
            "/v1beta/models/{*name}",
            get(proxy::gemini_models_get).post(proxy::gemini_post),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::downstream_auth,
        ));

    Router::new()
        .merge(proxied)
        .nest("/admin", admin::router(state.clone()))
        .route("/healthz", get(proxy::healthz))
        .with_state(state)
}
