//! Minimal HTTP/1.1 response decoding for the helper's raw stdout framing.
//!
//! The helper copies the upstream response verbatim: status line, headers,
//! then the body exactly as it came off the socket. That means chunked
//! transfer encoding and gzip are still in play and are undone here.

use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;

use crate::{TransportError, TransportResult};

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn is_gzip(&self) -> bool {
        self.header("content-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// Parse `status-line CRLF headers CRLF CRLF` from the front of `buf`.
/// Returns the head plus the number of bytes consumed, or None when the
/// blank line has not arrived yet.
pub(crate) fn parse_head(buf: &[u8]) -> TransportResult<Option<(ResponseHead, usize)>> {
    let Some(end) = find_head_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| TransportError::Network("non-utf8 response head".to_string()))?;
    let mut lines = text.split("\r\n").filter(|l| !l.is_empty());

    let status_line = lines
        .next()
        .ok_or_else(|| TransportError::Network("empty response head".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::Network(format!(
            "bad status line: {status_line}"
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Network(format!("bad status line: {status_line}")))?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(Some((ResponseHead { status, headers }, end)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .or_else(|| {
            // Tolerate bare-LF heads from misbehaving intermediaries.
            buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
        })
}

/// Incremental `Transfer-Encoding: chunked` decoder.
#[derive(Debug, Default)]
pub(crate) struct ChunkedDecoder {
    buf: Vec<u8>,
    /// Payload bytes still owed by the current chunk.
    remaining: usize,
    /// Framing bytes (the CRLF after a chunk payload) still to discard.
    skip: usize,
    done: bool,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn feed(&mut self, input: &[u8]) -> TransportResult<Vec<Bytes>> {
        self.buf.extend_from_slice(input);
        let mut out = Vec::new();

        while !self.done {
            if self.skip > 0 {
                let take = self.skip.min(self.buf.len());
                self.buf.drain(..take);
                self.skip -= take;
                if self.skip > 0 {
                    break;
                }
                continue;
            }

            if self.remaining > 0 {
                let take = self.remaining.min(self.buf.len());
                if take == 0 {
                    break;
                }
                out.push(Bytes::from(self.buf.drain(..take).collect::<Vec<u8>>()));
                self.remaining -= take;
                if self.remaining == 0 {
                    self.skip = 2;
                }
                continue;
            }

            let Some(line_end) = self.buf.windows(2).position(|w| w == b"\r\n") else {
                break;
            };
            let size_line: Vec<u8> = self.buf.drain(..line_end + 2).collect();
            let size_text = std::str::from_utf8(&size_line[..line_end])
                .map_err(|_| TransportError::Network("bad chunk size".to_string()))?;
            let size_text = size_text.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| TransportError::Network(format!("bad chunk size: {size_text}")))?;
            if size == 0 {
                self.done = true;
                break;
            }
            self.remaining = size;
        }

        Ok(out)
    }
}

pub(crate) fn gunzip(data: &[u8]) -> TransportResult<Vec<u8>> {
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        return Ok(data.to_vec());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| TransportError::Network(format!("gzip decode failed: {err}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_parses_status_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\nrest";
        let (head, used) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert!(head.is_chunked());
        assert_eq!(&raw[used..], b"rest");
    }

    #[test]
    fn head_waits_for_blank_line() {
        assert!(parse_head(b"HTTP/1.1 200 OK\r\nPartial: ye").unwrap().is_none());
    }

    #[test]
    fn chunked_decodes_across_feeds() {
        let mut dec = ChunkedDecoder::new();
        let mut collected = Vec::new();
        for chunk in dec.feed(b"5\r\nhel").unwrap() {
            collected.extend_from_slice(&chunk);
        }
        for chunk in dec.feed(b"lo\r\n6\r\n world\r\n0\r\n\r\n").unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");
        assert!(dec.is_done());
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let mut dec = ChunkedDecoder::new();
        let out = dec.feed(b"4;ext=1\r\nabcd\r\n0\r\n\r\n").unwrap();
        assert_eq!(out.concat(), b"abcd");
    }

    #[test]
    fn gunzip_passes_through_non_gzip() {
        assert_eq!(gunzip(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn gunzip_decodes_magic_payload() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"payload").unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(gunzip(&gz).unwrap(), b"payload");
    }
}
