//! Plain `wreq` path, used when the fingerprint helper is unavailable.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    Method, Transport, TransportBody, TransportError, TransportRequest, TransportResponse,
    TransportResult,
};

pub struct WreqTransport {
    default_proxy: Option<String>,
    clients: Mutex<HashMap<Option<String>, wreq::Client>>,
}

impl WreqTransport {
    pub fn new(default_proxy: Option<String>) -> Self {
        Self {
            default_proxy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, req: &TransportRequest) -> TransportResult<wreq::Client> {
        let proxy = req
            .proxy
            .clone()
            .or_else(|| self.default_proxy.clone())
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let mut guard = self
            .clients
            .lock()
            .map_err(|_| TransportError::Network("client cache lock poisoned".to_string()))?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }

        let mut builder = wreq::Client::builder().connect_timeout(req.connect_timeout);
        if let Some(url) = proxy.as_deref() {
            builder = builder
                .proxy(wreq::Proxy::all(url).map_err(|err| map_wreq_error(&err))?);
        }
        let client = builder.build().map_err(|err| map_wreq_error(&err))?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }

    async fn send(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
        want_stream: bool,
    ) -> TransportResult<TransportResponse> {
        let client = self.client_for(&req)?;
        let read_timeout = req.read_timeout;

        let method = match req.method {
            Method::Get => wreq::Method::GET,
            Method::Post => wreq::Method::POST,
        };
        let mut builder = client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let send = tokio::time::timeout(read_timeout, builder.send());
        let resp = tokio::select! {
            sent = send => match sent {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => return Err(map_wreq_error(&err)),
                Err(_) => return Err(TransportError::Timeout),
            },
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        if !want_stream || !(200..300).contains(&status) {
            let read = tokio::time::timeout(read_timeout, resp.bytes());
            let body = tokio::select! {
                read = read => match read {
                    Ok(Ok(body)) => body,
                    Ok(Err(err)) => return Err(map_wreq_error(&err)),
                    Err(_) => return Err(TransportError::Timeout),
                },
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            };
            return Ok(TransportResponse {
                status,
                headers,
                body: TransportBody::Bytes(body),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::select! {
                    next = tokio::time::timeout(read_timeout, stream.next()) => next,
                    _ = cancel.cancelled() => break,
                };
                let Ok(Some(item)) = next else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(TransportResponse {
            status,
            headers,
            body: TransportBody::Stream(rx),
        })
    }
}

#[async_trait]
impl Transport for WreqTransport {
    async fn fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse> {
        self.send(req, cancel, false).await
    }

    async fn stream_fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse> {
        self.send(req, cancel, true).await
    }
}

fn map_wreq_error(err: &wreq::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    TransportError::Network(err.to_string())
}
