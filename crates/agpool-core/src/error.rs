//! Upstream error taxonomy and classification.

use agpool_transport::TransportError;

pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Temporary unavailability; retryable with backoff. When
    /// `server_exhausted` the whole upstream is saturated and switching
    /// accounts does not help.
    #[error("{message}")]
    Capacity {
        message: String,
        server_exhausted: bool,
        retry_after_ms: Option<u64>,
    },
    /// 401 / UNAUTHENTICATED. `refresh_invalid` marks the terminal subtype
    /// (the refresh token itself was rejected).
    #[error("{message}")]
    Auth {
        message: String,
        refresh_invalid: bool,
    },
    /// 4xx (except 429), safety blocks, context-length, invalid arguments,
    /// unknown models. Never retried.
    #[error("{message}")]
    NonRetryable { message: String, status: u16 },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("upstream request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    /// Pool-level synthetic 429: no account can take the request right now.
    #[error("{message}")]
    NoCapacity {
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// Downstream parse failure, surfaced as 400.
    #[error("{message}")]
    BadRequest { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl UpstreamError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, UpstreamError::Capacity { .. })
    }

    pub fn is_server_exhausted(&self) -> bool {
        matches!(
            self,
            UpstreamError::Capacity {
                server_exhausted: true,
                ..
            }
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            UpstreamError::Capacity { retry_after_ms, .. }
            | UpstreamError::NoCapacity { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Status surfaced to the downstream client.
    pub fn http_status(&self) -> u16 {
        match self {
            UpstreamError::Capacity { .. } | UpstreamError::NoCapacity { .. } => 429,
            UpstreamError::Auth { .. } => 502,
            UpstreamError::NonRetryable { status, .. } => *status,
            UpstreamError::Network { .. } => 502,
            UpstreamError::Timeout => 504,
            UpstreamError::Cancelled => 499,
            UpstreamError::BadRequest { .. } => 400,
            UpstreamError::Storage { .. } => 500,
        }
    }

    /// Stable machine-readable code included in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            UpstreamError::Capacity { .. } => "capacity_exhausted",
            UpstreamError::Auth { .. } => "upstream_auth_error",
            UpstreamError::NonRetryable { .. } => "upstream_rejected",
            UpstreamError::Network { .. } => "upstream_network_error",
            UpstreamError::Timeout => "upstream_timeout",
            UpstreamError::Cancelled => "client_cancelled",
            UpstreamError::NoCapacity { .. } => "no_capacity_available",
            UpstreamError::BadRequest { .. } => "bad_request",
            UpstreamError::Storage { .. } => "internal_error",
        }
    }
}

impl From<TransportError> for UpstreamError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Spawn(message) | TransportError::Network(message) => {
                UpstreamError::Network { message }
            }
            TransportError::Timeout => UpstreamError::Timeout,
            TransportError::Cancelled => UpstreamError::Cancelled,
        }
    }
}

impl From<agpool_storage::StorageError> for UpstreamError {
    fn from(err: agpool_storage::StorageError) -> Self {
        UpstreamError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<agpool_translate::TranslateError> for UpstreamError {
    fn from(err: agpool_translate::TranslateError) -> Self {
        UpstreamError::BadRequest {
            message: err.to_string(),
        }
    }
}

const CAPACITY_MARKERS: [&str; 3] = [
    "exhausted your capacity on this model",
    "Resource has been exhausted",
    "No capacity available",
];

/// The stricter marker flagging a globally saturated upstream.
const SERVER_CAPACITY_MARKER: &str = "server capacity exhausted";

pub fn is_server_capacity_message(message: &str) -> bool {
    message
        .to_ascii_lowercase()
        .contains(SERVER_CAPACITY_MARKER)
}

/// `"… reset after 7s"` → 7.
pub fn parse_reset_after_secs(message: &str) -> Option<u64> {
    let idx = message.find("reset after")?;
    let rest = &message[idx + "reset after".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Classify a non-2xx upstream HTTP response.
pub fn classify_http(status: u16, body: &str) -> UpstreamError {
    let message = extract_message(body).unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("upstream returned status {status}")
        } else {
            truncate(body, 500)
        }
    });

    let is_capacity_message = CAPACITY_MARKERS
        .iter()
        .any(|marker| message.contains(marker));
    if status == 429 || is_capacity_message {
        let server_exhausted = is_server_capacity_message(&message);
        let retry_after_ms = parse_reset_after_secs(&message).map(|secs| (secs + 1) * 1000);
        return UpstreamError::Capacity {
            message,
            server_exhausted,
            retry_after_ms,
        };
    }

    if status == 401 || message.contains("UNAUTHENTICATED") {
        return UpstreamError::Auth {
            message,
            refresh_invalid: false,
        };
    }

    if (400..500).contains(&status) {
        return UpstreamError::NonRetryable { message, status };
    }

    // 5xx: transient, account-switchable.
    UpstreamError::Network { message }
}

fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_after_parses_seconds() {
        assert_eq!(
            parse_reset_after_secs("Resource has been exhausted, reset after 7s"),
            Some(7)
        );
        assert_eq!(parse_reset_after_secs("reset after 120s"), Some(120));
        assert_eq!(parse_reset_after_secs("no hint here"), None);
    }

    #[test]
    fn capacity_classification_sets_retry_after() {
        let err = classify_http(
            429,
            r#"{"error":{"message":"Resource has been exhausted, reset after 7s"}}"#,
        );
        let UpstreamError::Capacity {
            retry_after_ms,
            server_exhausted,
            ..
        } = err
        else {
            panic!("expected capacity");
        };
        assert_eq!(retry_after_ms, Some(8_000));
        assert!(!server_exhausted);
    }

    #[test]
    fn capacity_marker_without_429_still_classifies() {
        let err = classify_http(
            500,
            r#"{"error":{"message":"You have exhausted your capacity on this model"}}"#,
        );
        assert!(err.is_capacity());
    }

    #[test]
    fn server_capacity_marker_is_not_account_switchable() {
        let err = classify_http(429, r#"{"error":{"message":"Server capacity exhausted"}}"#);
        assert!(err.is_server_exhausted());
    }

    #[test]
    fn auth_and_non_retryable_split() {
        assert!(matches!(
            classify_http(401, "{}"),
            UpstreamError::Auth { .. }
        ));
        assert!(matches!(
            classify_http(400, r#"{"error":{"message":"invalid argument"}}"#),
            UpstreamError::NonRetryable { status: 400, .. }
        ));
        assert!(matches!(
            classify_http(503, "oops"),
            UpstreamError::Network { .. }
        ));
    }

    #[test]
    fn string_error_field_is_surfaced() {
        let err = classify_http(502, r#"{"error":"connect refused"}"#);
        assert_eq!(err.to_string(), "network error: connect refused");
    }
}
