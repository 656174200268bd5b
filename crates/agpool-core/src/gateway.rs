//! Dispatch: account selection, the two retry strategies, streaming
//! fan-out, and attempt logging.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agpool_common::models::ModelRoute;
use agpool_common::now_ms;
use agpool_protocol::gemini::{Content, GenerateResponse};
use agpool_protocol::sse::SseParser;
use agpool_protocol::upstream::{Envelope, parse_response};
use agpool_storage::{AccountRow, AttemptInsert, SqliteStore};
use agpool_transport::TransportBody;

use crate::camouflage::Camouflage;
use crate::error::{UpstreamError, UpstreamResult, classify_http};
use crate::pool::{AccountLease, AccountPool};
use crate::retry::{NextStep, RetryPolicy, capacity_delay, decide};
use crate::tokens::TokenManager;
use crate::upstream::UpstreamClient;

pub enum GenerateOutcome {
    Unary(GenerateResponse),
    /// Headers have arrived; chunks flow until the channel closes.
    Stream(mpsc::Receiver<GenerateResponse>),
}

pub struct Gateway {
    pub store: Arc<SqliteStore>,
    pub pool: Arc<AccountPool>,
    pub tokens: Arc<TokenManager>,
    pub upstream: Arc<UpstreamClient>,
    pub camouflage: Arc<Camouflage>,
    pub policy: RetryPolicy,
}

struct AttemptMeta {
    request_id: String,
    model: String,
    attempt_no: i32,
    account_attempt: i32,
    same_retry: i32,
}

impl Gateway {
    /// Full-retry strategy: per-account same-retries, bounded account
    /// switches, one auth reflow, global deadline.
    pub async fn generate(
        &self,
        route: &ModelRoute,
        mut envelope: Envelope,
        stream: bool,
        cancel: CancellationToken,
    ) -> UpstreamResult<GenerateOutcome> {
        let deadline = Instant::now() + self.policy.total_timeout;
        let request_id = envelope.request_id.clone();
        envelope.user_agent = self.upstream.user_agent();

        let mut exclude: HashSet<i64> = HashSet::new();
        let max_switches = self.pool.available_count(route).await.max(1);
        let mut attempt_no = 0i32;
        let mut account_attempt = 0i32;
        let mut last_error = UpstreamError::NoCapacity {
            message: "No capacity available".to_string(),
            retry_after_ms: None,
        };

        'accounts: while account_attempt < max_switches as i32 {
            if Instant::now() >= deadline {
                break;
            }
            let (account, lease) = match self.pool.get_next_account(route, &exclude).await {
                Ok(picked) => picked,
                // Before the first attempt the pool error is the story; after
                // that the last upstream error is more truthful.
                Err(pool_err) if account_attempt == 0 => return Err(pool_err),
                Err(_) => return Err(last_error),
            };
            account_attempt += 1;

            let account = match self.ensure_project(account, &cancel).await {
                Ok(account) => account,
                Err(err) => {
                    exclude.insert(lease.account_id());
                    drop(lease);
                    last_error = err;
                    continue;
                }
            };
            let mut access_token = account.access_token.clone().unwrap_or_default();
            envelope.bind_account(
                account.project_id.as_deref().unwrap_or_default(),
                account.session_id.as_deref(),
            );

            let mut refresh_spent = false;
            let mut same_retry = 0i32;
            loop {
                attempt_no += 1;
                let started = now_ms();
                let meta = AttemptMeta {
                    request_id: request_id.clone(),
                    model: route.upstream_model.clone(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                };
                let result = self
                    .call_generate(&envelope, &access_token, route, stream, &cancel)
                    .await;

                match result {
                    Ok(CallResult::Unary(resp)) => {
                        self.log_attempt(&meta, account.id, "success", started, None)
                            .await;
                        self.pool
                            .mark_account_success(account.id, &route.selection_key);
                        self.camouflage.report_request(&account, &request_id, route);
                        lease.release();
                        return Ok(GenerateOutcome::Unary(resp));
                    }
                    Ok(CallResult::Stream(body)) => {
                        let rx = self.spawn_stream_forwarder(
                            body,
                            meta,
                            started,
                            account.clone(),
                            lease,
                            route.clone(),
                            request_id.clone(),
                            cancel.clone(),
                        );
                        return Ok(GenerateOutcome::Stream(rx));
                    }
                    Err(err) => {
                        let status = if matches!(err, UpstreamError::Cancelled) {
                            "aborted"
                        } else {
                            "error"
                        };
                        self.log_attempt(&meta, account.id, status, started, Some(&err.to_string()))
                            .await;
                        if matches!(err, UpstreamError::Cancelled) {
                            drop(lease);
                            return Err(err);
                        }

                        match decide(&err, &self.policy, refresh_spent) {
                            NextStep::RetrySameAccount { delay }
                                if same_retry < self.policy.same_account_retries as i32 =>
                            {
                                let remaining = deadline.saturating_duration_since(Instant::now());
                                if remaining.is_zero() {
                                    drop(lease);
                                    return Err(err);
                                }
                                same_retry += 1;
                                tokio::time::sleep(delay.min(remaining)).await;
                                last_error = err;
                                continue;
                            }
                            NextStep::RetrySameAccount { .. } => {
                                exclude.insert(account.id);
                                drop(lease);
                                last_error = err;
                                continue 'accounts;
                            }
                            NextStep::RefreshAndRetry => {
                                refresh_spent = true;
                                match self.tokens.force_refresh(account.id).await {
                                    Ok(fresh) => {
                                        access_token =
                                            fresh.access_token.clone().unwrap_or_default();
                                        last_error = err;
                                        continue;
                                    }
                                    Err(refresh_err) => {
                                        self.pool
                                            .mark_account_error(
                                                account.id,
                                                &refresh_err.to_string(),
                                            )
                                            .await;
                                        exclude.insert(account.id);
                                        drop(lease);
                                        last_error = refresh_err;
                                        continue 'accounts;
                                    }
                                }
                            }
                            NextStep::SwitchAccount { cooldown } => {
                                if cooldown {
                                    self.pool.mark_capacity_limited(
                                        account.id,
                                        &route.selection_key,
                                        &err.to_string(),
                                    );
                                } else if !err.is_capacity() {
                                    self.pool
                                        .mark_account_error(account.id, &err.to_string())
                                        .await;
                                }
                                exclude.insert(account.id);
                                drop(lease);
                                last_error = err;
                                continue 'accounts;
                            }
                            NextStep::Fail => {
                                drop(lease);
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Capacity-retry strategy for light calls: a new account per attempt
    /// unless the upstream itself is saturated, delays from the reset hint.
    pub async fn count_tokens(
        &self,
        route: &ModelRoute,
        contents: &[Content],
        cancel: CancellationToken,
    ) -> UpstreamResult<u64> {
        let attempts = self.policy.max_capacity_retries + 2;
        let mut exclude: HashSet<i64> = HashSet::new();
        let body =
            agpool_translate::gemini::count_tokens_body(&route.upstream_model, contents);
        let request_id = crate::new_internal_request_id();

        let mut last_error = UpstreamError::NoCapacity {
            message: "No capacity available".to_string(),
            retry_after_ms: None,
        };
        for attempt in 1..=attempts {
            let (account, lease) = match self.pool.get_next_account(route, &exclude).await {
                Ok(picked) => picked,
                Err(pool_err) if attempt == 1 => return Err(pool_err),
                Err(_) => return Err(last_error),
            };
            let token = account.access_token.clone().unwrap_or_default();
            let started = now_ms();
            let meta = AttemptMeta {
                request_id: request_id.clone(),
                model: route.upstream_model.clone(),
                attempt_no: attempt as i32,
                account_attempt: attempt as i32,
                same_retry: 0,
            };
            let result = self
                .upstream
                .rpc("countTokens", &token, &body, &request_id, None, &cancel)
                .await;
            drop(lease);

            match result {
                Ok(value) => {
                    self.log_attempt(&meta, account.id, "success", started, None)
                        .await;
                    self.pool
                        .mark_account_success(account.id, &route.selection_key);
                    return Ok(value
                        .get("totalTokens")
                        .and_then(|t| t.as_u64())
                        .unwrap_or(0));
                }
                Err(err) => {
                    let status = if matches!(err, UpstreamError::Cancelled) {
                        "aborted"
                    } else {
                        "error"
                    };
                    self.log_attempt(&meta, account.id, status, started, Some(&err.to_string()))
                        .await;
                    if !err.is_capacity() || attempt == attempts {
                        return Err(err);
                    }
                    if !err.is_server_exhausted() {
                        self.pool.mark_capacity_limited(
                            account.id,
                            &route.selection_key,
                            &err.to_string(),
                        );
                        exclude.insert(account.id);
                    }
                    let delay = capacity_delay(&err, &self.policy, attempt);
                    tokio::time::sleep(delay).await;
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn ensure_project(
        &self,
        account: AccountRow,
        cancel: &CancellationToken,
    ) -> UpstreamResult<AccountRow> {
        if account
            .project_id
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
        {
            return Ok(account);
        }
        let project = self.tokens.fetch_project_id(&account, cancel).await?;
        self.store
            .update_account_identity(account.id, None, None, Some(&project))
            .await?;
        tracing::info!(account_id = account.id, %project, "project id onboarded");
        self.store.get_account(account.id).await.map_err(Into::into)
    }

    async fn call_generate(
        &self,
        envelope: &Envelope,
        access_token: &str,
        route: &ModelRoute,
        stream: bool,
        cancel: &CancellationToken,
    ) -> UpstreamResult<CallResult> {
        let body = Bytes::from(serde_json::to_vec(envelope).map_err(|err| {
            UpstreamError::BadRequest {
                message: format!("request serialization failed: {err}"),
            }
        })?);
        let rpc = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let resp = self
            .upstream
            .rpc_raw(
                rpc,
                access_token,
                body,
                &envelope.request_id,
                Some(route.request_type),
                stream,
                cancel,
            )
            .await?;

        if !resp.is_success() {
            let status = resp.status;
            let body = resp.into_bytes().await;
            return Err(classify_http(status, &String::from_utf8_lossy(&body)));
        }

        if stream {
            return Ok(CallResult::Stream(resp.body));
        }
        let body = resp.into_bytes().await;
        let text = String::from_utf8_lossy(&body);
        parse_response(&text)
            .map(CallResult::Unary)
            .ok_or_else(|| UpstreamError::Network {
                message: "unparseable upstream response".to_string(),
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_stream_forwarder(
        &self,
        body: TransportBody,
        meta: AttemptMeta,
        started: i64,
        account: AccountRow,
        lease: AccountLease,
        route: ModelRoute,
        request_id: String,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<GenerateResponse> {
        let (tx, rx) = mpsc::channel::<GenerateResponse>(32);
        let store = self.store.clone();
        let pool = self.pool.clone();
        let camouflage = self.camouflage.clone();

        tokio::spawn(async move {
            let mut bytes_rx = match body {
                TransportBody::Stream(rx) => rx,
                TransportBody::Bytes(bytes) => {
                    // Buffered body on the stream path: forward it whole.
                    let mut parser = SseParser::new();
                    let mut events = parser.push(&bytes);
                    events.extend(parser.finish());
                    for event in events {
                        if let Some(resp) = parse_response(&event.data)
                            && tx.send(resp).await.is_err()
                        {
                            break;
                        }
                    }
                    log_attempt_row(&store, &meta, account.id, "success", started, None).await;
                    pool.mark_account_success(account.id, &route.selection_key);
                    drop(lease);
                    return;
                }
            };

            let mut parser = SseParser::new();
            let mut status = "success";
            'read: loop {
                let chunk = tokio::select! {
                    chunk = bytes_rx.recv() => chunk,
                    _ = cancel.cancelled() => {
                        status = "aborted";
                        break 'read;
                    }
                };
                let Some(chunk) = chunk else { break };
                for event in parser.push(&chunk) {
                    if let Some(resp) = parse_response(&event.data)
                        && tx.send(resp).await.is_err()
                    {
                        // Downstream went away mid-stream.
                        status = "aborted";
                        break 'read;
                    }
                }
            }
            if status != "aborted" {
                for event in parser.finish() {
                    if let Some(resp) = parse_response(&event.data) {
                        let _ = tx.send(resp).await;
                    }
                }
            }

            log_attempt_row(&store, &meta, account.id, status, started, None).await;
            if status == "success" {
                pool.mark_account_success(account.id, &route.selection_key);
                camouflage.report_request(&account, &request_id, &route);
            }
            drop(lease);
        });
        rx
    }

    async fn log_attempt(
        &self,
        meta: &AttemptMeta,
        account_id: i64,
        status: &str,
        started: i64,
        error: Option<&str>,
    ) {
        log_attempt_row(&self.store, meta, account_id, status, started, error).await;
    }
}

enum CallResult {
    Unary(GenerateResponse),
    Stream(TransportBody),
}

async fn log_attempt_row(
    store: &SqliteStore,
    meta: &AttemptMeta,
    account_id: i64,
    status: &str,
    started: i64,
    error: Option<&str>,
) {
    let insert = AttemptInsert {
        request_id: meta.request_id.clone(),
        account_id: Some(account_id),
        model: meta.model.clone(),
        attempt_no: meta.attempt_no,
        account_attempt: meta.account_attempt,
        same_retry: meta.same_retry,
        status: status.to_string(),
        latency_ms: Some(now_ms() - started),
        error_message: error.map(|e| e.to_string()),
        started_at: started,
    };
    if let Err(err) = store.insert_attempt(insert).await {
        tracing::debug!(error = %err, "attempt log write failed");
    }
}
