//! Gemini dialect: near-passthrough.
//!
//! The client already speaks the canonical shape; translation is limited to
//! the fixed safety block, thought-signature replay on tool history, and the
//! envelope wrap.

use agpool_common::models::ModelRoute;
use agpool_protocol::gemini::{GenerateRequest, Part};
use agpool_protocol::upstream::Envelope;
use serde_json::json;

use crate::{BuiltRequest, SENTINEL_SIGNATURE, ThoughtSignatures, TranslateResult, safety};

pub fn build_upstream(
    mut req: GenerateRequest,
    route: &ModelRoute,
    signatures: &dyn ThoughtSignatures,
    now_ms: i64,
) -> TranslateResult<BuiltRequest> {
    for content in &mut req.contents {
        for part in &mut content.parts {
            if let Part::FunctionCall {
                function_call,
                thought_signature,
            } = part
                && thought_signature.is_none()
            {
                let cached = function_call
                    .id
                    .as_deref()
                    .and_then(|id| signatures.tool_signature(id));
                // Replayed history without a signature would fail upstream
                // tool validation; the sentinel bypasses it.
                *thought_signature =
                    Some(cached.unwrap_or_else(|| SENTINEL_SIGNATURE.to_string()));
            }
        }
    }

    req.safety_settings = Some(safety::safety_settings_for(&route.upstream_model));

    let mut envelope = Envelope::new(route.upstream_model.clone(), req, now_ms);
    envelope.request_type = route.request_type.to_string();
    Ok(BuiltRequest {
        envelope,
        thinking_downgraded: false,
    })
}

/// Body of the v1internal countTokens RPC.
pub fn count_tokens_body(
    model: &str,
    contents: &[agpool_protocol::gemini::Content],
) -> serde_json::Value {
    json!({
        "request": {
            "model": format!("models/{model}"),
            "contents": contents,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agpool_common::models::resolve_model;
    use agpool_protocol::gemini::{Content, FunctionCall};
    use crate::NoSignatures;

    #[test]
    fn replayed_tool_calls_get_sentinel_signatures() {
        let req = GenerateRequest {
            contents: vec![
                Content::user(vec![Part::text("go")]),
                Content::model(vec![Part::FunctionCall {
                    function_call: FunctionCall {
                        id: Some("call_1".into()),
                        name: "f".into(),
                        args: None,
                    },
                    thought_signature: None,
                }]),
            ],
            ..Default::default()
        };
        let route = resolve_model("gemini-2.5-flash");
        let built = build_upstream(req, &route, &NoSignatures, 1).unwrap();
        let Part::FunctionCall {
            thought_signature, ..
        } = &built.envelope.request.contents[1].parts[0]
        else {
            panic!("expected functionCall");
        };
        assert_eq!(thought_signature.as_deref(), Some(SENTINEL_SIGNATURE));
        assert_eq!(
            built.envelope.request.safety_settings.as_ref().unwrap().len(),
            11
        );
    }

    #[test]
    fn existing_signatures_are_left_alone() {
        let req = GenerateRequest {
            contents: vec![Content::model(vec![Part::FunctionCall {
                function_call: FunctionCall {
                    id: Some("call_1".into()),
                    name: "f".into(),
                    args: None,
                },
                thought_signature: Some("client-sig".into()),
            }])],
            ..Default::default()
        };
        let route = resolve_model("gemini-2.5-flash");
        let built = build_upstream(req, &route, &NoSignatures, 1).unwrap();
        let Part::FunctionCall {
            thought_signature, ..
        } = &built.envelope.request.contents[0].parts[0]
        else {
            panic!("expected functionCall");
        };
        assert_eq!(thought_signature.as_deref(), Some("client-sig"));
    }

    #[test]
    fn count_tokens_body_wraps_request() {
        let body = count_tokens_body("gemini-2.5-flash", &[Content::user(vec![Part::text("x")])]);
        assert_eq!(body["request"]["model"], "models/gemini-2.5-flash");
        assert_eq!(body["request"]["contents"][0]["parts"][0]["text"], "x");
    }
}
