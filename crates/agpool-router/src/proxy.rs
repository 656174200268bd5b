//! Dialect route handlers: parse, translate, dispatch, re-encode.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use agpool_common::models::{EXPOSED_MODELS, ModelRoute, resolve_model};
use agpool_common::now_ms;
use agpool_core::{GenerateOutcome, UpstreamError};
use agpool_protocol::gemini::GenerateResponse;
use agpool_protocol::sse;
use agpool_protocol::{claude, gemini, openai};
use agpool_translate as translate;

use crate::error_body::{Dialect, error_response};
use crate::AppState;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

type FrameSender = mpsc::Sender<Result<Bytes, Infallible>>;

// ── OpenAI ──

pub async fn openai_chat(State(state): State<AppState>, body: Bytes) -> Response {
    let req: openai::ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return bad_request(Dialect::OpenAi, &format!("invalid json: {err}")),
    };
    let route = resolve_model(&req.model);
    let stream = req.stream.unwrap_or(false);
    let include_usage = req
        .stream_options
        .map(|opts| opts.include_usage)
        .unwrap_or(false);

    let built = match translate::openai::build_upstream(
        req,
        &route,
        &state.translate_opts,
        state.signatures.as_ref(),
        now_ms(),
    ) {
        Ok(built) => built,
        Err(err) => return bad_request(Dialect::OpenAi, &err.to_string()),
    };
    let request_id = built.envelope.request_id.clone();
    let started = now_ms();
    let cancel = CancellationToken::new();

    match state
        .gateway
        .generate(&route, built.envelope, stream, cancel.clone())
        .await
    {
        Ok(GenerateOutcome::Unary(resp)) => {
            let completion = translate::openai::encode_response(
                &resp,
                &route,
                &request_id,
                started / 1000,
                &state.translate_opts,
                state.signatures.as_ref(),
            );
            log_request(&state, &request_id, Dialect::OpenAi, &route, "success", started);
            axum::Json(completion).into_response()
        }
        Ok(GenerateOutcome::Stream(rx)) => {
            let encoder = translate::openai::StreamEncoder::new(
                &route,
                &request_id,
                started / 1000,
                &state.translate_opts,
                include_usage,
            );
            let frames = spawn_openai_frames(state, route, request_id, started, encoder, rx, cancel);
            sse_response(frames)
        }
        Err(err) => {
            log_request(&state, &request_id, Dialect::OpenAi, &route, "error", started);
            maybe_nudge_version(&state, &err);
            error_response(Dialect::OpenAi, &err)
        }
    }
}

fn spawn_openai_frames(
    state: AppState,
    route: ModelRoute,
    request_id: String,
    started: i64,
    mut encoder: translate::openai::StreamEncoder,
    mut rx: mpsc::Receiver<GenerateResponse>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Bytes, Infallible>> {
    let (tx, out) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut keep_alive = tokio::time::interval(SSE_KEEP_ALIVE);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.reset();

        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    for frame in encoder.push(&chunk, state.signatures.as_ref()) {
                        if !send_json_frame(&tx, &frame).await {
                            cancel.cancel();
                            return;
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    if tx.send(Ok(sse::keep_alive_frame())).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
        for frame in encoder.finish() {
            if !send_json_frame(&tx, &frame).await {
                cancel.cancel();
                return;
            }
        }
        let _ = tx.send(Ok(sse::done_frame())).await;
        log_request(&state, &request_id, Dialect::OpenAi, &route, "success", started);
    });
    out
}

// ── Anthropic ──

pub async fn claude_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let req: claude::MessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return bad_request(Dialect::Claude, &format!("invalid json: {err}")),
    };
    let route = resolve_model(&req.model);
    let stream = req.stream.unwrap_or(false);

    let built = match translate::claude::build_upstream(
        req,
        &route,
        &state.translate_opts,
        state.signatures.as_ref(),
        now_ms(),
    ) {
        Ok(built) => built,
        Err(err) => return bad_request(Dialect::Claude, &err.to_string()),
    };
    let request_id = built.envelope.request_id.clone();
    let started = now_ms();
    let cancel = CancellationToken::new();

    match state
        .gateway
        .generate(&route, built.envelope, stream, cancel.clone())
        .await
    {
        Ok(GenerateOutcome::Unary(resp)) => {
            let message = translate::claude::encode_response(
                &resp,
                &route,
                &request_id,
                state.signatures.as_ref(),
            );
            log_request(&state, &request_id, Dialect::Claude, &route, "success", started);
            axum::Json(message).into_response()
        }
        Ok(GenerateOutcome::Stream(rx)) => {
            let encoder = translate::claude::StreamEncoder::new(&route, &request_id);
            let frames = spawn_claude_frames(state, route, request_id, started, encoder, rx, cancel);
            sse_response(frames)
        }
        Err(err) => {
            log_request(&state, &request_id, Dialect::Claude, &route, "error", started);
            maybe_nudge_version(&state, &err);
            error_response(Dialect::Claude, &err)
        }
    }
}

fn spawn_claude_frames(
    state: AppState,
    route: ModelRoute,
    request_id: String,
    started: i64,
    mut encoder: translate::claude::StreamEncoder,
    mut rx: mpsc::Receiver<GenerateResponse>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Bytes, Infallible>> {
    let (tx, out) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut keep_alive = tokio::time::interval(SSE_KEEP_ALIVE);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.reset();

        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    for event in encoder.push(&chunk, state.signatures.as_ref()) {
                        if !send_claude_frame(&tx, &event).await {
                            cancel.cancel();
                            return;
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    if tx.send(Ok(sse::keep_alive_frame())).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
        for event in encoder.finish() {
            if !send_claude_frame(&tx, &event).await {
                cancel.cancel();
                return;
            }
        }
        log_request(&state, &request_id, Dialect::Claude, &route, "success", started);
    });
    out
}

pub async fn claude_count_tokens(State(state): State<AppState>, body: Bytes) -> Response {
    let req: claude::MessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return bad_request(Dialect::Claude, &format!("invalid json: {err}")),
    };
    let route = resolve_model(&req.model);
    let built = match translate::claude::build_upstream(
        req,
        &route,
        &state.translate_opts,
        state.signatures.as_ref(),
        now_ms(),
    ) {
        Ok(built) => built,
        Err(err) => return bad_request(Dialect::Claude, &err.to_string()),
    };

    let cancel = CancellationToken::new();
    match state
        .gateway
        .count_tokens(&route, &built.envelope.request.contents, cancel)
        .await
    {
        Ok(total) => axum::Json(claude::CountTokensResponse {
            input_tokens: total,
        })
        .into_response(),
        Err(err) => error_response(Dialect::Claude, &err),
    }
}

// ── Gemini ──

pub async fn gemini_post(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let Some((model, action)) = name.split_once(':') else {
        return bad_request(Dialect::Gemini, "missing model action");
    };
    let route = resolve_model(model);

    match action {
        "generateContent" | "streamGenerateContent" => {
            let req: gemini::GenerateRequest = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(err) => return bad_request(Dialect::Gemini, &format!("invalid json: {err}")),
            };
            let stream = action == "streamGenerateContent";
            let built = match translate::gemini::build_upstream(
                req,
                &route,
                state.signatures.as_ref(),
                now_ms(),
            ) {
                Ok(built) => built,
                Err(err) => return bad_request(Dialect::Gemini, &err.to_string()),
            };
            let request_id = built.envelope.request_id.clone();
            let started = now_ms();
            let cancel = CancellationToken::new();

            match state
                .gateway
                .generate(&route, built.envelope, stream, cancel.clone())
                .await
            {
                Ok(GenerateOutcome::Unary(resp)) => {
                    log_request(&state, &request_id, Dialect::Gemini, &route, "success", started);
                    axum::Json(resp).into_response()
                }
                Ok(GenerateOutcome::Stream(rx)) => {
                    let frames = spawn_gemini_frames(state, route, request_id, started, rx, cancel);
                    sse_response(frames)
                }
                Err(err) => {
                    log_request(&state, &request_id, Dialect::Gemini, &route, "error", started);
                    maybe_nudge_version(&state, &err);
                    error_response(Dialect::Gemini, &err)
                }
            }
        }
        "countTokens" => {
            let req: gemini::CountTokensRequest = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(err) => return bad_request(Dialect::Gemini, &format!("invalid json: {err}")),
            };
            let cancel = CancellationToken::new();
            match state.gateway.count_tokens(&route, &req.contents, cancel).await {
                Ok(total) => axum::Json(gemini::CountTokensResponse {
                    total_tokens: total,
                })
                .into_response(),
                Err(err) => error_response(Dialect::Gemini, &err),
            }
        }
        _ => bad_request(Dialect::Gemini, &format!("unknown action: {action}")),
    }
}

fn spawn_gemini_frames(
    state: AppState,
    route: ModelRoute,
    request_id: String,
    started: i64,
    mut rx: mpsc::Receiver<GenerateResponse>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Bytes, Infallible>> {
    let (tx, out) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut keep_alive = tokio::time::interval(SSE_KEEP_ALIVE);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.reset();

        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if !send_json_frame(&tx, &chunk).await {
                        cancel.cancel();
                        return;
                    }
                }
                _ = keep_alive.tick() => {
                    if tx.send(Ok(sse::keep_alive_frame())).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
        log_request(&state, &request_id, Dialect::Gemini, &route, "success", started);
    });
    out
}

// ── model listings ──

pub async fn models_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if headers.contains_key("anthropic-version") {
        return claude_models_list(&state);
    }
    let created = now_ms() / 1000;
    let data = EXPOSED_MODELS
        .iter()
        .map(|m| openai::ModelEntry {
            id: m.id.to_string(),
            object: "model",
            created,
            owned_by: "agpool",
        })
        .collect();
    axum::Json(openai::ModelList {
        object: "list",
        data,
    })
    .into_response()
}

pub async fn models_get(
    State(_state): State<AppState>,
    Path(model): Path<String>,
) -> Response {
    let created = now_ms() / 1000;
    match EXPOSED_MODELS.iter().find(|m| m.id == model) {
        Some(m) => axum::Json(openai::ModelEntry {
            id: m.id.to_string(),
            object: "model",
            created,
            owned_by: "agpool",
        })
        .into_response(),
        None => error_response(
            Dialect::OpenAi,
            &UpstreamError::NonRetryable {
                message: format!("model not found: {model}"),
                status: 404,
            },
        ),
    }
}

fn claude_models_list(_state: &AppState) -> Response {
    let data = EXPOSED_MODELS
        .iter()
        .map(|m| claude::ModelEntry {
            id: m.id.to_string(),
            kind: "model",
            display_name: m.display_name.to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
        })
        .collect();
    axum::Json(claude::ModelList {
        data,
        has_more: false,
    })
    .into_response()
}

pub async fn gemini_models_list(State(_state): State<AppState>) -> Response {
    let models: Vec<gemini::ModelInfo> = EXPOSED_MODELS
        .iter()
        .map(|m| gemini::ModelInfo {
            name: format!("models/{}", m.id),
            display_name: m.display_name.to_string(),
            version: "1".to_string(),
            supported_generation_methods: vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
                "countTokens".to_string(),
            ],
            input_token_limit: Some(1_048_576),
            output_token_limit: Some(65_536),
        })
        .collect();
    axum::Json(serde_json::json!({ "models": models })).into_response()
}

pub async fn gemini_models_get(
    State(_state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let id = name.strip_prefix("models/").unwrap_or(&name);
    match EXPOSED_MODELS.iter().find(|m| m.id == id) {
        Some(m) => axum::Json(gemini::ModelInfo {
            name: format!("models/{}", m.id),
            display_name: m.display_name.to_string(),
            version: "1".to_string(),
            supported_generation_methods: vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
                "countTokens".to_string(),
            ],
            input_token_limit: Some(1_048_576),
            output_token_limit: Some(65_536),
        })
        .into_response(),
        None => error_response(
            Dialect::Gemini,
            &UpstreamError::NonRetryable {
                message: format!("model not found: {name}"),
                status: 404,
            },
        ),
    }
}

// ── shared plumbing ──

fn sse_response(frames: mpsc::Receiver<Result<Bytes, Infallible>>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(frames)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn send_json_frame<T: serde::Serialize>(tx: &FrameSender, value: &T) -> bool {
    let Ok(payload) = serde_json::to_vec(value) else {
        return true;
    };
    tx.send(Ok(sse::data_frame(&payload))).await.is_ok()
}

async fn send_claude_frame(tx: &FrameSender, event: &claude::StreamEvent) -> bool {
    let Ok(payload) = serde_json::to_vec(event) else {
        return true;
    };
    tx.send(Ok(sse::named_frame(event.event_name(), &payload)))
        .await
        .is_ok()
}

fn bad_request(dialect: Dialect, message: &str) -> Response {
    error_response(
        dialect,
        &UpstreamError::BadRequest {
            message: message.to_string(),
        },
    )
}

fn log_request(
    state: &AppState,
    request_id: &str,
    dialect: Dialect,
    route: &ModelRoute,
    status: &str,
    started: i64,
) {
    let store = state.store.clone();
    let request_id = request_id.to_string();
    let model = route.exposed.clone();
    let dialect = dialect.as_str();
    let status = status.to_string();
    let latency = now_ms() - started;
    tokio::spawn(async move {
        if let Err(err) = store
            .insert_request_log(&request_id, dialect, &model, &status, Some(latency))
            .await
        {
            tracing::debug!(error = %err, "request log write failed");
        }
    });
}

/// The upstream complains about outdated clients with a dedicated message;
/// poke the version fetcher when it does.
fn maybe_nudge_version(state: &AppState, err: &UpstreamError) {
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("version") && (text.contains("outdated") || text.contains("update")) {
        state.version.nudge();
    }
}

pub async fn healthz() -> Response {
    axum::Json(serde_json::json!({ "status": "ok" })).into_response()
}
