//! Anthropic messages request → upstream envelope.

use std::collections::HashMap;

use agpool_common::models::ModelRoute;
use agpool_protocol::claude::{
    ContentBlockIn, ImageSource, Message, MessageContent, MessageRole, MessagesRequest,
    SystemBlock, SystemPrompt, Thinking, ToolChoice, ToolDefinition, ToolResultBlock,
    ToolResultContent,
};
use agpool_protocol::gemini::{
    Content, FunctionCall, FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration,
    FunctionResponse, GenerateRequest, GenerationConfig, Part, Role, Tool, ToolConfig,
};
use agpool_protocol::upstream::Envelope;
use serde_json::json;

use crate::limits::ToolOutputLimiter;
use crate::thinking::{self, ThinkingAsk};
use crate::{
    BuiltRequest, OFFICIAL_PREAMBLE, ThoughtSignatures, TranslateError, TranslateOptions,
    TranslateResult, safety,
};

pub fn build_upstream(
    mut req: MessagesRequest,
    route: &ModelRoute,
    opts: &TranslateOptions,
    signatures: &dyn ThoughtSignatures,
    now_ms: i64,
) -> TranslateResult<BuiltRequest> {
    if req.messages.is_empty() {
        return Err(TranslateError::BadRequest("messages must not be empty".into()));
    }

    let ask = match &req.thinking {
        Some(Thinking::Enabled { budget_tokens }) => ThinkingAsk::Enabled {
            budget: *budget_tokens,
        },
        Some(Thinking::Adaptive { budget_tokens }) => ThinkingAsk::Adaptive {
            budget: *budget_tokens,
        },
        Some(Thinking::Disabled) => ThinkingAsk::Disabled,
        None => ThinkingAsk::Unspecified,
    };
    let mut thinking_budget = thinking::resolve(route, ask, None);

    // A trailing text-only assistant message is a prefill. The upstream
    // rejects prefill together with thinking, so it moves into a system
    // hint instead.
    let mut prefill_hint = None;
    if thinking_budget.is_some()
        && let Some(last) = req.messages.last()
        && last.role == MessageRole::Assistant
        && let Some(text) = text_only(&last.content)
    {
        prefill_hint = Some(prefill_to_hint(&text));
        req.messages.pop();
    }

    let mut tool_names: HashMap<String, String> = HashMap::new();
    for message in &req.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlockIn::ToolUse { id, name, .. } = block {
                    tool_names.insert(id.clone(), name.clone());
                }
            }
        }
    }

    let mut limiter = ToolOutputLimiter::new(opts);
    let mut contents: Vec<Content> = Vec::new();
    let mut thinking_downgraded = false;
    let thinking_on = thinking_budget.is_some();

    for message in req.messages {
        let (role, parts) = match message.role {
            MessageRole::User => (
                Role::User,
                user_parts(message.content, &tool_names, &mut limiter),
            ),
            MessageRole::Assistant => (
                Role::Model,
                assistant_parts(
                    message.content,
                    opts,
                    signatures,
                    thinking_on,
                    &mut thinking_downgraded,
                ),
            ),
        };
        if parts.is_empty() {
            continue;
        }
        // The upstream wants alternating roles; fold same-role runs.
        if let Some(last) = contents.last_mut()
            && last.role == Some(role)
        {
            last.parts.extend(parts);
            continue;
        }
        contents.push(Content { role: Some(role), parts });
    }

    if thinking_downgraded {
        tracing::warn!(
            model = %route.exposed,
            "disabling thinking for this turn: no cached signature for replayed tool_use"
        );
        thinking_budget = None;
    }

    let mut max_output_tokens = req.max_tokens;
    if let Some(budget) = thinking_budget {
        let (clamped_budget, clamped_max) = thinking::clamp_for_claude(budget, max_output_tokens);
        thinking_budget = Some(clamped_budget);
        max_output_tokens = clamped_max;
    }

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: Some(max_output_tokens),
        stop_sequences: req.stop_sequences,
        thinking_config: thinking_budget.map(thinking::to_config),
        ..Default::default()
    };

    let system_instruction = build_system_instruction(req.system, prefill_hint, opts);
    let request = GenerateRequest {
        contents,
        system_instruction,
        generation_config: Some(generation_config),
        tools: map_tools(req.tools),
        tool_config: map_tool_choice(req.tool_choice),
        safety_settings: Some(safety::safety_settings_for(&route.upstream_model)),
        session_id: None,
    };

    let mut envelope = Envelope::new(route.upstream_model.clone(), request, now_ms);
    envelope.request_type = route.request_type.to_string();
    Ok(BuiltRequest {
        envelope,
        thinking_downgraded,
    })
}

fn text_only(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Text(text) => Some(text.clone()),
        MessageContent::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                match block {
                    ContentBlockIn::Text { text } => out.push_str(text),
                    _ => return None,
                }
            }
            (!out.is_empty()).then_some(out)
        }
    }
}

fn prefill_to_hint(prefill: &str) -> String {
    let trimmed = prefill.trim();
    if trimmed == "{" || trimmed.starts_with('{') {
        "Return only a single JSON object and start your response with '{'.".to_string()
    } else {
        format!("Start your response with the following prefix exactly: {prefill}")
    }
}

fn user_parts(
    content: MessageContent,
    tool_names: &HashMap<String, String>,
    limiter: &mut ToolOutputLimiter,
) -> Vec<Part> {
    let blocks = match content {
        MessageContent::Text(text) => {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![Part::text(text)]
            };
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlockIn::Text { text } => {
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
            }
            ContentBlockIn::Image { source } => {
                if let Some(part) = image_part(source) {
                    parts.push(part);
                }
            }
            ContentBlockIn::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let (text, images) = split_tool_result(content);
                let mut text = limiter.take(text);
                if is_error == Some(true) && !text.starts_with("Error") {
                    text = format!("Error: {text}");
                }
                let name = tool_names
                    .get(&tool_use_id)
                    .cloned()
                    .unwrap_or_else(|| tool_use_id.clone());
                parts.push(Part::FunctionResponse {
                    function_response: FunctionResponse {
                        id: Some(tool_use_id),
                        name,
                        response: json!({ "output": text }),
                    },
                });
                parts.extend(images);
            }
            ContentBlockIn::ToolUse { .. }
            | ContentBlockIn::Thinking { .. }
            | ContentBlockIn::RedactedThinking { .. } => {}
        }
    }
    parts
}

fn assistant_parts(
    content: MessageContent,
    opts: &TranslateOptions,
    signatures: &dyn ThoughtSignatures,
    thinking_on: bool,
    thinking_downgraded: &mut bool,
) -> Vec<Part> {
    let blocks = match content {
        MessageContent::Text(text) => {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![Part::text(text)]
            };
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let has_thinking_block = blocks
        .iter()
        .any(|b| matches!(b, ContentBlockIn::Thinking { .. }));
    let first_tool_id = blocks.iter().find_map(|b| match b {
        ContentBlockIn::ToolUse { id, .. } => Some(id.clone()),
        _ => None,
    });

    let mut parts = Vec::new();

    // Clients rarely replay their thinking blocks; reproduce the one the
    // upstream validated against from the cache.
    if thinking_on
        && !has_thinking_block
        && let Some(id) = &first_tool_id
    {
        match signatures.claude_thinking(id) {
            Some((signature, text)) => {
                let text = if text.is_empty() && opts.replay_space_fallback {
                    " ".to_string()
                } else {
                    text
                };
                parts.push(Part::thought(text, Some(signature)));
            }
            None => *thinking_downgraded = true,
        }
    }

    for block in blocks {
        match block {
            ContentBlockIn::Text { text } => {
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
            }
            ContentBlockIn::Thinking {
                thinking,
                signature,
            } => {
                if thinking_on {
                    parts.push(Part::thought(thinking, signature));
                }
            }
            ContentBlockIn::RedactedThinking { .. } => {}
            ContentBlockIn::ToolUse { id, name, input } => {
                parts.push(Part::FunctionCall {
                    function_call: FunctionCall {
                        id: Some(id),
                        name,
                        args: Some(input),
                    },
                    thought_signature: None,
                });
            }
            ContentBlockIn::Image { .. } | ContentBlockIn::ToolResult { .. } => {}
        }
    }
    parts
}

fn image_part(source: ImageSource) -> Option<Part> {
    match source {
        ImageSource::Base64 { media_type, data } => Some(Part::inline_data(media_type, data)),
        ImageSource::Url { .. } => None,
    }
}

fn split_tool_result(content: Option<ToolResultContent>) -> (String, Vec<Part>) {
    match content {
        None => (String::new(), Vec::new()),
        Some(ToolResultContent::Text(text)) => (text, Vec::new()),
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for block in blocks {
                match block {
                    ToolResultBlock::Text { text } => texts.push(text),
                    ToolResultBlock::Image { source } => {
                        if let Some(part) = image_part(source) {
                            images.push(part);
                        }
                    }
                }
            }
            (texts.join("\n"), images)
        }
    }
}

fn build_system_instruction(
    system: Option<SystemPrompt>,
    prefill_hint: Option<String>,
    opts: &TranslateOptions,
) -> Option<Content> {
    let mut texts = Vec::new();
    if opts.official_system_prompt {
        texts.push(OFFICIAL_PREAMBLE.to_string());
    }
    match system {
        Some(SystemPrompt::Text(text)) => {
            if !text.is_empty() {
                texts.push(text);
            }
        }
        Some(SystemPrompt::Blocks(blocks)) => {
            for block in blocks {
                let SystemBlock::Text { text } = block;
                if !text.is_empty() {
                    texts.push(text);
                }
            }
        }
        None => {}
    }
    texts.extend(prefill_hint);
    if texts.is_empty() {
        None
    } else {
        Some(Content::system_text(texts.join("\n")))
    }
}

fn map_tools(tools: Option<Vec<ToolDefinition>>) -> Option<Vec<Tool>> {
    let tools = tools?;
    let declarations: Vec<FunctionDeclaration> = tools
        .into_iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            parameters: tool.input_schema,
        })
        .collect();
    if declarations.is_empty() {
        return None;
    }
    Some(vec![Tool {
        function_declarations: Some(declarations),
        google_search: None,
    }])
}

fn map_tool_choice(choice: Option<ToolChoice>) -> Option<ToolConfig> {
    let config = match choice? {
        ToolChoice::Auto => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Auto),
            allowed_function_names: None,
        },
        ToolChoice::Any => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: None,
        },
        ToolChoice::None => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::None),
            allowed_function_names: None,
        },
        ToolChoice::Tool { name } => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![name]),
        },
    };
    Some(ToolConfig {
        function_calling_config: Some(config),
    })
}
