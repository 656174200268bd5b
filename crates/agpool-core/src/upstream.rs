//! The v1internal RPC surface, shared by dispatch, token sync, and the
//! camouflage schedulers so everything rides the same TLS fingerprint.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use agpool_common::AppConfig;
use agpool_transport::{Transport, TransportRequest, TransportResponse};

use crate::error::{UpstreamError, UpstreamResult, classify_http};

pub const UPSTREAM_BASE: &str = "https://daily-cloudcode-pa.googleapis.com";
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub const OAUTH_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const OAUTH_CLIENT_SECRET: &str = "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";

const DEFAULT_CLIENT_VERSION: &str = "1.15.8";

pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    user_agent: ArcSwap<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream_read_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(transport: Arc<dyn Transport>, cfg: &AppConfig) -> Self {
        Self {
            transport,
            user_agent: ArcSwap::from_pointee(format!(
                "antigravity/{DEFAULT_CLIENT_VERSION} windows/amd64"
            )),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            stream_read_timeout: Duration::from_millis(cfg.stream_read_timeout_ms),
        }
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.load().as_ref().clone()
    }

    /// Hot-swap the advertised client version (version fetcher).
    pub fn set_client_version(&self, version: &str) {
        let ua = format!("antigravity/{version} windows/amd64");
        if *self.user_agent.load().as_ref() != ua {
            tracing::info!(%ua, "user-agent updated");
            self.user_agent.store(Arc::new(ua));
        }
    }

    fn internal_request(
        &self,
        rpc: &str,
        access_token: &str,
        body: Bytes,
        request_id: &str,
        request_type: Option<&str>,
        stream: bool,
    ) -> TransportRequest {
        let suffix = if stream { "?alt=sse" } else { "" };
        let mut req = TransportRequest::post(format!("{UPSTREAM_BASE}/v1internal:{rpc}{suffix}"))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", self.user_agent())
            .header("Accept-Encoding", "gzip")
            .header("requestid", request_id);
        if let Some(request_type) = request_type {
            req = req.header("requesttype", request_type);
        }
        req.connect_timeout = self.connect_timeout;
        req.read_timeout = if stream {
            self.stream_read_timeout
        } else {
            self.read_timeout
        };
        req.body = Some(body);
        req
    }

    /// Unary RPC; non-2xx responses come back classified.
    pub async fn rpc(
        &self,
        rpc: &str,
        access_token: &str,
        body: &serde_json::Value,
        request_id: &str,
        request_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> UpstreamResult<serde_json::Value> {
        let body = Bytes::from(serde_json::to_vec(body).unwrap_or_default());
        let req = self.internal_request(rpc, access_token, body, request_id, request_type, false);
        let resp = self.transport.fetch(req, cancel).await?;
        let status = resp.status;
        let bytes = resp.into_bytes().await;
        if !(200..300).contains(&status) {
            return Err(classify_http(status, &String::from_utf8_lossy(&bytes)));
        }
        serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Network {
            message: format!("invalid upstream json: {err}"),
        })
    }

    /// Unary RPC with a raw byte body (the generate path keeps its own
    /// serialization).
    pub async fn rpc_raw(
        &self,
        rpc: &str,
        access_token: &str,
        body: Bytes,
        request_id: &str,
        request_type: Option<&str>,
        stream: bool,
        cancel: &CancellationToken,
    ) -> UpstreamResult<TransportResponse> {
        let req = self.internal_request(rpc, access_token, body, request_id, request_type, stream);
        let resp = if stream {
            self.transport.stream_fetch(req, cancel).await?
        } else {
            self.transport.fetch(req, cancel).await?
        };
        Ok(resp)
    }

    /// Fire-and-forget POST used by the camouflage schedulers.
    pub async fn fire_rpc(
        &self,
        rpc: &str,
        access_token: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) {
        let request_id = crate::new_internal_request_id();
        if let Err(err) = self
            .rpc(rpc, access_token, body, &request_id, None, cancel)
            .await
        {
            tracing::debug!(rpc, error = %err, "background rpc failed");
        }
    }

    /// `application/x-www-form-urlencoded` POST (OAuth refresh).
    pub async fn form_post(
        &self,
        url: &str,
        form: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> UpstreamResult<(u16, Bytes)> {
        let body: String = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let mut req = TransportRequest::post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", self.user_agent())
            .header("Accept", "application/json");
        req.connect_timeout = self.connect_timeout;
        req.read_timeout = self.connect_timeout;
        req.body = Some(Bytes::from(body));
        let resp = self.transport.fetch(req, cancel).await?;
        let status = resp.status;
        let bytes = resp.into_bytes().await;
        Ok((status, bytes))
    }

    /// Plain GET for non-Google chatter (unleash, updater).
    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> UpstreamResult<(u16, Vec<(String, String)>, Bytes)> {
        let mut req = TransportRequest::get(url).header("User-Agent", self.user_agent());
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        req.connect_timeout = self.connect_timeout;
        req.read_timeout = self.read_timeout;
        let resp = self.transport.fetch(req, cancel).await?;
        let status = resp.status;
        let headers = resp.headers.clone();
        let bytes = resp.into_bytes().await;
        Ok((status, headers, bytes))
    }

    /// Plain POST with JSON body for non-Google chatter.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> UpstreamResult<(u16, Bytes)> {
        let mut req = TransportRequest::post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", self.user_agent());
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        req.connect_timeout = self.connect_timeout;
        req.read_timeout = self.read_timeout;
        req.body = Some(Bytes::from(serde_json::to_vec(body).unwrap_or_default()));
        let resp = self.transport.fetch(req, cancel).await?;
        let status = resp.status;
        let bytes = resp.into_bytes().await;
        Ok((status, bytes))
    }
}
