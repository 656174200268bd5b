//! Upstream unary response → OpenAI chat completion.

use agpool_common::ThinkingOutput;
use agpool_common::models::ModelRoute;
use agpool_protocol::gemini::{GenerateResponse, Part};
use agpool_protocol::openai::{
    AssistantMessage, ChatCompletion, Choice, CompletionTokensDetails, FunctionCallPayload,
    ToolCall, ToolCallKind, Usage,
};

use crate::{ThoughtSignatures, TranslateOptions, finish};

pub fn encode_response(
    resp: &GenerateResponse,
    route: &ModelRoute,
    request_id: &str,
    created: i64,
    opts: &TranslateOptions,
    signatures: &dyn ThoughtSignatures,
) -> ChatCompletion {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut captured_thought: Option<(String, String)> = None;

    let candidate = resp.candidates.first();
    if let Some(candidate) = candidate
        && let Some(body) = &candidate.content
    {
        for part in &body.parts {
            match part {
                Part::Thought {
                    thought: true,
                    text,
                    thought_signature,
                } => {
                    reasoning.push_str(text);
                    if let Some(signature) = thought_signature {
                        captured_thought = Some((signature.clone(), text.clone()));
                    }
                }
                Part::Thought { .. } => {}
                Part::Text { text } => content.push_str(text),
                Part::InlineData { inline_data } => {
                    content.push_str(&format!(
                        "![image](data:{};base64,{})",
                        inline_data.mime_type, inline_data.data
                    ));
                }
                Part::FunctionCall {
                    function_call,
                    thought_signature,
                } => {
                    let id = function_call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    if let Some(signature) = thought_signature {
                        signatures.remember_tool_signature(&id, signature);
                    }
                    if route.is_claude()
                        && tool_calls.is_empty()
                        && let Some((signature, text)) = &captured_thought
                    {
                        signatures.remember_claude_thinking(&id, signature, text);
                    }
                    tool_calls.push(ToolCall {
                        id,
                        kind: ToolCallKind::Function,
                        function: FunctionCallPayload {
                            name: function_call.name.clone(),
                            arguments: function_call
                                .args
                                .as_ref()
                                .map(|args| args.to_string())
                                .unwrap_or_else(|| "{}".to_string()),
                        },
                    });
                }
                Part::FunctionResponse { .. } => {}
            }
        }
    }

    let content = render_content(content, &reasoning, opts.thinking_output);
    let reasoning_field = (!reasoning.is_empty()
        && opts.thinking_output.wants_reasoning_field())
    .then_some(reasoning);

    let finish_reason = finish::to_openai(
        candidate.and_then(|c| c.finish_reason.as_deref()),
        !tool_calls.is_empty(),
    );

    ChatCompletion {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion",
        created,
        model: route.exposed.clone(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content: Some(content),
                reasoning_content: reasoning_field,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
        }],
        usage: resp.usage_metadata.as_ref().map(usage_from_metadata),
    }
}

fn render_content(content: String, reasoning: &str, mode: ThinkingOutput) -> String {
    if reasoning.is_empty() || !mode.wants_tags() {
        return content;
    }
    format!("<think>{reasoning}</think>{content}")
}

pub(super) fn usage_from_metadata(meta: &agpool_protocol::gemini::UsageMetadata) -> Usage {
    let prompt = meta.prompt_token_count.unwrap_or(0);
    let reasoning = meta.thoughts_token_count.unwrap_or(0);
    let completion = meta.candidates_token_count.unwrap_or(0) + reasoning;
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: meta.total_token_count.unwrap_or(prompt + completion),
        completion_tokens_details: (reasoning > 0).then_some(CompletionTokensDetails {
            reasoning_tokens: reasoning,
        }),
    }
}
