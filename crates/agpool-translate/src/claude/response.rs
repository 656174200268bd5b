//! Upstream unary response → Anthropic message.

use agpool_common::models::ModelRoute;
use agpool_protocol::claude::{ContentBlockOut, MessagesResponse, Usage};
use agpool_protocol::gemini::{GenerateResponse, Part, UsageMetadata};
use agpool_protocol::upstream::trajectory_id;

use crate::{ThoughtSignatures, finish};

pub fn encode_response(
    resp: &GenerateResponse,
    route: &ModelRoute,
    request_id: &str,
    signatures: &dyn ThoughtSignatures,
) -> MessagesResponse {
    let mut blocks: Vec<ContentBlockOut> = Vec::new();
    let mut captured_thought: Option<(String, String)> = None;
    let mut saw_tool_use = false;

    let candidate = resp.candidates.first();
    if let Some(candidate) = candidate
        && let Some(content) = &candidate.content
    {
        for part in &content.parts {
            match part {
                Part::Thought {
                    thought: true,
                    text,
                    thought_signature,
                } => {
                    if let Some(signature) = thought_signature {
                        captured_thought = Some((signature.clone(), text.clone()));
                    }
                    blocks.push(ContentBlockOut::Thinking {
                        thinking: text.clone(),
                        signature: thought_signature.clone(),
                    });
                }
                Part::Thought { .. } => {}
                Part::Text { text } => match blocks.last_mut() {
                    Some(ContentBlockOut::Text { text: existing }) => existing.push_str(text),
                    _ => blocks.push(ContentBlockOut::Text { text: text.clone() }),
                },
                Part::InlineData { inline_data } => {
                    let markdown = format!(
                        "![image](data:{};base64,{})",
                        inline_data.mime_type, inline_data.data
                    );
                    blocks.push(ContentBlockOut::Text { text: markdown });
                }
                Part::FunctionCall {
                    function_call,
                    thought_signature,
                } => {
                    let id = function_call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                    if let Some(signature) = thought_signature {
                        signatures.remember_tool_signature(&id, signature);
                    }
                    if !saw_tool_use
                        && let Some((signature, text)) = &captured_thought
                    {
                        signatures.remember_claude_thinking(&id, signature, text);
                    }
                    saw_tool_use = true;
                    blocks.push(ContentBlockOut::ToolUse {
                        id,
                        name: function_call.name.clone(),
                        input: function_call
                            .args
                            .clone()
                            .unwrap_or(serde_json::Value::Object(Default::default())),
                    });
                }
                Part::FunctionResponse { .. } => {}
            }
        }
    }

    let stop_reason = finish::to_claude(
        candidate.and_then(|c| c.finish_reason.as_deref()),
        saw_tool_use,
    );

    MessagesResponse {
        id: message_id(request_id),
        kind: "message",
        role: "assistant",
        model: route.exposed.clone(),
        content: blocks,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: resp
            .usage_metadata
            .as_ref()
            .map(usage_from_metadata)
            .unwrap_or_default(),
    }
}

pub(super) fn message_id(request_id: &str) -> String {
    match trajectory_id(request_id) {
        Some(uuid) => format!("msg_{}", uuid.replace('-', "")),
        None => format!("msg_{}", uuid::Uuid::new_v4().simple()),
    }
}

pub(super) fn usage_from_metadata(meta: &UsageMetadata) -> Usage {
    Usage {
        input_tokens: meta.prompt_token_count.unwrap_or(0),
        output_tokens: meta.candidates_token_count.unwrap_or(0)
            + meta.thoughts_token_count.unwrap_or(0),
        cache_read_input_tokens: meta.cached_content_token_count,
    }
}
