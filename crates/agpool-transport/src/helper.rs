//! Child-process path: one helper invocation per request.
//!
//! The job is written to the helper's stdin as a single JSON document whose
//! `headers` object must keep the caller's insertion order: the helper
//! writes headers to the wire in that exact order, which is part of the
//! fingerprint. The object is therefore assembled by hand instead of going
//! through a serde map.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::http1::{ChunkedDecoder, ResponseHead, gunzip, parse_head};
use crate::{
    Transport, TransportBody, TransportError, TransportRequest, TransportResponse, TransportResult,
};

pub struct HelperTransport {
    helper_path: String,
    tls_config_path: String,
    default_proxy: Option<String>,
}

impl HelperTransport {
    pub fn new(
        helper_path: String,
        tls_config_path: String,
        default_proxy: Option<String>,
    ) -> Self {
        Self {
            helper_path,
            tls_config_path,
            default_proxy,
        }
    }

    async fn spawn(&self, req: &TransportRequest) -> TransportResult<Child> {
        let mut child = Command::new(&self.helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Spawn(err.to_string()))?;

        let proxy = req.proxy.as_deref().or(self.default_proxy.as_deref());
        let job = encode_job(req, &self.tls_config_path, proxy);
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("helper stdin unavailable".to_string()))?;
        stdin
            .write_all(job.as_bytes())
            .await
            .map_err(|err| TransportError::Spawn(err.to_string()))?;
        drop(stdin);
        Ok(child)
    }
}

#[async_trait]
impl Transport for HelperTransport {
    async fn fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse> {
        let read_timeout = req.read_timeout;
        let mut child = self.spawn(&req).await?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("helper stdout unavailable".to_string()))?;

        let mut raw = Vec::new();
        let read_all = async {
            stdout
                .read_to_end(&mut raw)
                .await
                .map_err(|err| TransportError::Network(err.to_string()))
        };
        tokio::select! {
            result = tokio::time::timeout(read_timeout, read_all) => {
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        let _ = child.kill().await;
                        return Err(err);
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                        return Err(TransportError::Timeout);
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(TransportError::Cancelled);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| TransportError::Spawn(err.to_string()))?;
        if !status.success() {
            return Err(TransportError::Network(read_helper_error(&mut child).await));
        }

        let (head, consumed) = parse_head(&raw)?
            .ok_or_else(|| TransportError::Network("truncated helper response".to_string()))?;
        let body = decode_unary_body(&head, &raw[consumed..])?;
        Ok(TransportResponse {
            status: head.status,
            headers: head.headers,
            body: TransportBody::Bytes(body),
        })
    }

    async fn stream_fetch(
        &self,
        req: TransportRequest,
        cancel: &CancellationToken,
    ) -> TransportResult<TransportResponse> {
        let read_timeout = req.read_timeout;
        let mut child = self.spawn(&req).await?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("helper stdout unavailable".to_string()))?;

        // Read until headers are complete, then hand the remainder plus the
        // live pipe to a forwarding task.
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let head = loop {
            if let Some((head, consumed)) = parse_head(&buf)? {
                buf.drain(..consumed);
                break head;
            }
            let mut chunk = [0u8; 4096];
            let read = tokio::select! {
                read = tokio::time::timeout(read_timeout, stdout.read(&mut chunk)) => {
                    match read {
                        Ok(Ok(0)) => {
                            let _ = child.kill().await;
                            let stderr = read_helper_error(&mut child).await;
                            return Err(TransportError::Network(stderr));
                        }
                        Ok(Ok(read)) => read,
                        Ok(Err(err)) => {
                            let _ = child.kill().await;
                            return Err(TransportError::Network(err.to_string()));
                        }
                        Err(_) => {
                            let _ = child.kill().await;
                            return Err(TransportError::Timeout);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(TransportError::Cancelled);
                }
            };
            buf.extend_from_slice(&chunk[..read]);
        };

        let chunked = head.is_chunked();
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut decoder = chunked.then(ChunkedDecoder::new);
            let decode = |decoder: &mut Option<ChunkedDecoder>, data: &[u8]| {
                if data.is_empty() {
                    return Ok(Vec::new());
                }
                match decoder {
                    Some(decoder) => decoder.feed(data),
                    None => Ok(vec![Bytes::copy_from_slice(data)]),
                }
            };

            match decode(&mut decoder, &buf) {
                Ok(frames) => {
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "chunked decode failed mid-stream");
                    let _ = child.kill().await;
                    return;
                }
            }

            let mut chunk = [0u8; 8192];
            loop {
                let read = tokio::select! {
                    read = tokio::time::timeout(read_timeout, stdout.read(&mut chunk)) => read,
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                };
                match read {
                    Ok(Ok(0)) => break,
                    Ok(Ok(read)) => {
                        match decode(&mut decoder, &chunk[..read]) {
                            Ok(frames) => {
                                for frame in frames {
                                    if tx.send(frame).await.is_err() {
                                        let _ = child.kill().await;
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "chunked decode failed mid-stream");
                                let _ = child.kill().await;
                                return;
                            }
                        }
                        if decoder.as_ref().is_some_and(|d| d.is_done()) {
                            break;
                        }
                    }
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            let _ = child.wait().await;
        });

        Ok(TransportResponse {
            status: head.status,
            headers: head.headers,
            body: TransportBody::Stream(rx),
        })
    }
}

fn decode_unary_body(head: &ResponseHead, raw: &[u8]) -> TransportResult<Bytes> {
    let mut body: Vec<u8>;
    if head.is_chunked() {
        let mut decoder = ChunkedDecoder::new();
        body = Vec::with_capacity(raw.len());
        for frame in decoder.feed(raw)? {
            body.extend_from_slice(&frame);
        }
    } else if let Some(len) = head.content_length() {
        body = raw[..len.min(raw.len())].to_vec();
    } else {
        body = raw.to_vec();
    }
    if head.is_gzip() {
        body = gunzip(&body)?;
    }
    Ok(Bytes::from(body))
}

async fn read_helper_error(child: &mut Child) -> String {
    let mut stderr_buf = Vec::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_end(&mut stderr_buf).await;
    }
    // The helper reports failures as a JSON {"error": ...} document.
    if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&stderr_buf)
        && let Some(message) = parsed.get("error").and_then(|v| v.as_str())
    {
        return message.to_string();
    }
    let text = String::from_utf8_lossy(&stderr_buf).trim().to_string();
    if text.is_empty() {
        "helper exited with an error".to_string()
    } else {
        text
    }
}

/// Assemble the stdin job document, headers object in insertion order.
fn encode_job(req: &TransportRequest, config_path: &str, proxy: Option<&str>) -> String {
    let mut job = String::with_capacity(512);
    job.push('{');
    job.push_str(&format!(
        "\"method\":{},\"url\":{},",
        json_string(req.method.as_str()),
        json_string(&req.url)
    ));
    job.push_str("\"headers\":{");
    for (idx, (name, value)) in req.headers.iter().enumerate() {
        if idx > 0 {
            job.push(',');
        }
        job.push_str(&json_string(name));
        job.push(':');
        job.push_str(&json_string(value));
    }
    job.push_str("},");
    let body = req
        .body
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    job.push_str(&format!(
        "\"body\":{},\"config_path\":{},\"timeout\":{{\"connect\":{},\"read\":{}}}",
        json_string(&body),
        json_string(config_path),
        req.connect_timeout.as_secs().max(1),
        req.read_timeout.as_secs().max(1),
    ));
    if let Some(proxy) = proxy {
        let kind = if proxy.starts_with("socks") {
            "socks5"
        } else {
            "http"
        };
        job.push_str(&format!(
            ",\"proxy\":{{\"enabled\":true,\"type\":{},\"url\":{}}}",
            json_string(kind),
            json_string(proxy)
        ));
    }
    job.push('}');
    job
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransportRequest {
        TransportRequest::post("https://example.com/v1internal:generateContent")
            .header("Authorization", "Bearer tok")
            .header("Content-Type", "application/json")
            .header("User-Agent", "antigravity/1.0 windows/amd64")
    }

    #[test]
    fn job_preserves_header_order() {
        let job = encode_job(&request(), "bin/tls_config.json", None);
        let auth = job.find("Authorization").unwrap();
        let content_type = job.find("Content-Type").unwrap();
        let user_agent = job.find("User-Agent").unwrap();
        assert!(auth < content_type && content_type < user_agent);
        // Still valid JSON for the helper's decoder.
        let parsed: serde_json::Value = serde_json::from_str(&job).unwrap();
        assert_eq!(parsed["timeout"]["connect"], 30);
        assert!(parsed.get("proxy").is_none());
    }

    #[test]
    fn job_carries_proxy_when_set() {
        let job = encode_job(&request(), "cfg.json", Some("socks5://127.0.0.1:1080"));
        let parsed: serde_json::Value = serde_json::from_str(&job).unwrap();
        assert_eq!(parsed["proxy"]["enabled"], true);
        assert_eq!(parsed["proxy"]["type"], "socks5");
    }

    #[test]
    fn unary_body_dechunks_and_gunzips() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(br#"{"ok":true}"#).unwrap();
        let gz = enc.finish().unwrap();

        let mut wire = format!("{:x}\r\n", gz.len()).into_bytes();
        wire.extend_from_slice(&gz);
        wire.extend_from_slice(b"\r\n0\r\n\r\n");

        let head = ResponseHead {
            status: 200,
            headers: vec![
                ("Transfer-Encoding".into(), "chunked".into()),
                ("Content-Encoding".into(), "gzip".into()),
            ],
        };
        let body = decode_unary_body(&head, &wire).unwrap();
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }
}
