//! Outbound HTTPS with a fixed TLS ClientHello fingerprint.
//!
//! The primary path spawns a helper binary per request (uTLS-based; the
//! upstream fingerprints ClientHellos to spot non-official clients). When the
//! helper is missing or disabled the platform [`wreq`] client is used
//! instead. Both paths expose the same [`Transport`] trait with unary and
//! streaming fetches.

mod fallback;
mod helper;
mod http1;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use fallback::WreqTransport;
pub use helper::HelperTransport;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("helper spawn failed: {0}")]
    Spawn(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Header order is significant: the helper writes headers to the wire in
/// exactly the order given here.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub proxy: Option<String>,
}

impl TransportRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            proxy: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            ..Self::post(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub enum TransportBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: TransportBody,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body to bytes regardless of mode.
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            TransportBody::Bytes(bytes) => bytes,
            TransportBody::Stream(mut rx) => {
                let mut buf = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk);
                }
                Bytes::from(buf)
            }
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Buffered request/response; the body is fully read before returning.
    async fn fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse>;

    /// Resolves when response headers arrive; the body is a byte stream.
    /// Cancelling the token tears the connection (and helper process) down.
    async fn stream_fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse>;
}

/// Helper-first transport with the wreq fallback the env flag selects.
pub struct FingerprintTransport {
    helper: Option<HelperTransport>,
    fallback: WreqTransport,
}

impl FingerprintTransport {
    pub fn new(
        use_fingerprint: bool,
        helper_path: &str,
        tls_config_path: &str,
        default_proxy: Option<String>,
    ) -> Self {
        let helper = if use_fingerprint && std::path::Path::new(helper_path).is_file() {
            Some(HelperTransport::new(
                helper_path.to_string(),
                tls_config_path.to_string(),
                default_proxy.clone(),
            ))
        } else {
            if use_fingerprint {
                tracing::warn!(
                    helper_path,
                    "fingerprint helper not found, using plain https client"
                );
            }
            None
        };
        Self {
            helper,
            fallback: WreqTransport::new(default_proxy),
        }
    }

    fn pick(&self) -> &dyn Transport {
        match &self.helper {
            Some(helper) => helper,
            None => &self.fallback,
        }
    }
}

#[async_trait]
impl Transport for FingerprintTransport {
    async fn fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse> {
        self.pick().fetch(req, cancel).await
    }

    async fn stream_fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse> {
        self.pick().stream_fetch(req, cancel).await
    }
}
