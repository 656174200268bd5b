//! The v1internal envelope wrapping every upstream call.

use serde::{Deserialize, Serialize};

use crate::gemini::{GenerateRequest, GenerateResponse};

/// Request ids look like `agent/<epoch-ms>/<uuid>/<digit>`; the middle uuid
/// doubles as the trajectory id the telemetry scheduler reports.
pub fn new_request_id(now_ms: i64) -> String {
    let uuid = uuid::Uuid::new_v4();
    let digit = (uuid.as_u128() % 10) as u8;
    format!("agent/{now_ms}/{uuid}/{digit}")
}

/// The `<uuid>` segment of a request id, used as the trajectory id.
pub fn trajectory_id(request_id: &str) -> Option<&str> {
    request_id.split('/').nth(2)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub model: String,
    pub project: String,
    pub request_id: String,
    pub request: GenerateRequest,
    pub user_agent: String,
    pub request_type: String,
}

impl Envelope {
    pub fn new(model: impl Into<String>, request: GenerateRequest, now_ms: i64) -> Self {
        Self {
            model: model.into(),
            project: String::new(),
            request_id: new_request_id(now_ms),
            request,
            user_agent: String::new(),
            request_type: "agent".to_string(),
        }
    }

    /// Bind the per-account fields just before dispatch.
    pub fn bind_account(&mut self, project: &str, session_id: Option<&str>) {
        self.project = project.to_string();
        if let Some(session_id) = session_id {
            self.request.session_id = Some(session_id.to_string());
        }
    }
}

/// Streamed v1internal chunks arrive as `{"response": {...}}`; unary replies
/// use the same wrapper. Some error paths return the bare response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    pub response: GenerateResponse,
}

pub fn parse_response(data: &str) -> Option<GenerateResponse> {
    if let Ok(wrapped) = serde_json::from_str::<ResponseEnvelope>(data) {
        return Some(wrapped.response);
    }
    serde_json::from_str::<GenerateResponse>(data)
        .ok()
        .filter(|resp| !resp.candidates.is_empty() || resp.usage_metadata.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_has_expected_shape() {
        let id = new_request_id(1_722_000_000_000);
        let segments: Vec<&str> = id.split('/').collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], "agent");
        assert_eq!(segments[1], "1722000000000");
        assert_eq!(trajectory_id(&id), Some(segments[2]));
        assert!(segments[3].parse::<u8>().unwrap() < 10);
    }

    #[test]
    fn parse_response_unwraps_envelope() {
        let raw = r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#;
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.candidates.len(), 1);

        let bare = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}"#;
        assert!(parse_response(bare).is_some());

        assert!(parse_response(r#"{"other":1}"#).is_none());
    }
}
