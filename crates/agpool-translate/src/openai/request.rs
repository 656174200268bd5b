//! OpenAI chat-completions request → upstream envelope.

use std::collections::{HashMap, HashSet};

use agpool_common::models::ModelRoute;
use agpool_protocol::gemini::{
    Content, FunctionCall, FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration,
    FunctionResponse, GenerateRequest, GenerationConfig, Part, Tool, ToolConfig,
};
use agpool_protocol::openai::{
    ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, ResponseFormat, StopConfig,
    ToolCall, ToolChoice, ToolChoiceMode, ToolDefinition,
};
use agpool_protocol::upstream::Envelope;
use serde_json::Value as JsonValue;
use serde_json::json;

use crate::limits::ToolOutputLimiter;
use crate::thinking::{self, ThinkingAsk};
use crate::{
    BuiltRequest, OFFICIAL_PREAMBLE, SENTINEL_SIGNATURE, ThoughtSignatures, TranslateError,
    TranslateOptions, TranslateResult, safety, tool_id_matches_family,
};

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;
const DEFAULT_TEMPERATURE: f64 = 1.0;

pub fn build_upstream(
    req: ChatCompletionRequest,
    route: &ModelRoute,
    opts: &TranslateOptions,
    signatures: &dyn ThoughtSignatures,
    now_ms: i64,
) -> TranslateResult<BuiltRequest> {
    if req.messages.is_empty() {
        return Err(TranslateError::BadRequest("messages must not be empty".into()));
    }

    let has_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
    let thinking_ask = match &req.thinking {
        Some(directive) => match directive.kind.as_deref() {
            Some("enabled") => ThinkingAsk::Enabled {
                budget: directive.budget_tokens,
            },
            Some("adaptive") => ThinkingAsk::Adaptive {
                budget: directive.budget_tokens,
            },
            Some("disabled") => ThinkingAsk::Disabled,
            _ => ThinkingAsk::Unspecified,
        },
        None => ThinkingAsk::Unspecified,
    };
    let mut thinking_budget =
        thinking::resolve(route, thinking_ask, req.reasoning_effort.as_deref());

    let mut walker = MessageWalker {
        route,
        opts,
        signatures,
        thinking_on: thinking_budget.is_some(),
        system_texts: Vec::new(),
        contents: Vec::new(),
        tool_names: HashMap::new(),
        degraded_ids: HashSet::new(),
        limiter: ToolOutputLimiter::new(opts),
        thinking_downgraded: false,
    };
    for message in req.messages {
        walker.push(message);
    }
    let MessageWalker {
        system_texts,
        contents,
        thinking_downgraded,
        ..
    } = walker;

    if thinking_downgraded {
        tracing::warn!(
            model = %route.exposed,
            "disabling thinking for this turn: no cached signature for replayed tool call"
        );
        thinking_budget = None;
    }

    let mut max_output_tokens = req.max_completion_tokens.or(req.max_tokens).unwrap_or(
        if has_tools {
            opts.max_output_tokens_with_tools
        } else {
            DEFAULT_MAX_OUTPUT_TOKENS
        },
    );
    if route.is_claude()
        && let Some(budget) = thinking_budget
    {
        let (clamped_budget, clamped_max) = thinking::clamp_for_claude(budget, max_output_tokens);
        thinking_budget = Some(clamped_budget);
        max_output_tokens = clamped_max;
    }

    let (response_json_schema, response_mime_type) = map_response_format(req.response_format);
    let generation_config = GenerationConfig {
        temperature: Some(req.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        top_p: req.top_p,
        max_output_tokens: Some(max_output_tokens),
        stop_sequences: match req.stop {
            Some(StopConfig::Single(stop)) => Some(vec![stop]),
            Some(StopConfig::Many(stops)) => Some(stops),
            None => None,
        },
        response_mime_type,
        response_json_schema,
        thinking_config: thinking_budget.map(thinking::to_config),
        ..Default::default()
    };

    let system_instruction = build_system_instruction(system_texts, opts);
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

struct MessageWalker<'a> {
    route: &'a ModelRoute,
    opts: &'a TranslateOptions,
    signatures: &'a dyn ThoughtSignatures,
    thinking_on: bool,
    system_texts: Vec<String>,
    contents: Vec<Content>,
    tool_names: HashMap<String, String>,
    degraded_ids: HashSet<String>,
    limiter: ToolOutputLimiter,
    thinking_downgraded: bool,
}

impl MessageWalker<'_> {
    fn push(&mut self, message: ChatMessage) {
        match message {
            ChatMessage::System { content } | ChatMessage::Developer { content } => {
                if let Some(text) = content_to_text(content) {
                    self.system_texts.push(text);
                }
            }
            ChatMessage::User { content } => {
                let parts = user_parts(content);
                if !parts.is_empty() {
                    self.contents.push(Content::user(parts));
                }
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
                ..
            } => self.push_assistant(content, tool_calls),
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => self.push_tool_result(tool_call_id, content),
        }
    }

    fn push_assistant(
        &mut self,
        content: Option<MessageContent>,
        tool_calls: Option<Vec<ToolCall>>,
    ) {
        let mut parts = Vec::new();
        if let Some(text) = content.and_then(content_to_text)
            && !text.is_empty()
        {
            parts.push(Part::text(text));
        }

        if let Some(calls) = tool_calls
            && !calls.is_empty()
        {
            let degrade = calls
                .iter()
                .any(|call| !tool_id_matches_family(&call.id, self.route.is_claude()));
            if degrade {
                // Foreign-family tool ids: the upstream would reject the
                // replay, so the exchange is narrated as plain text.
                for call in calls {
                    self.degraded_ids.insert(call.id.clone());
                    parts.push(Part::text(format!(
                        "[called tool {}({})]",
                        call.function.name, call.function.arguments
                    )));
                }
            } else {
                if self.route.is_claude() && self.thinking_on {
                    match self.signatures.claude_thinking(&calls[0].id) {
                        Some((signature, text)) => {
                            let text = if text.is_empty() && self.opts.replay_space_fallback {
                                " ".to_string()
                            } else {
                                text
                            };
                            parts.push(Part::thought(text, Some(signature)));
                        }
                        None => self.thinking_downgraded = true,
                    }
                }
                for call in calls {
                    self.tool_names
                        .insert(call.id.clone(), call.function.name.clone());
                    let args = serde_json::from_str(&call.function.arguments)
                        .unwrap_or(JsonValue::String(call.function.arguments.clone()));
                    let thought_signature = if self.route.is_claude() {
                        None
                    } else {
                        Some(
                            self.signatures
                                .tool_signature(&call.id)
                                .unwrap_or_else(|| SENTINEL_SIGNATURE.to_string()),
                        )
                    };
                    parts.push(Part::FunctionCall {
                        function_call: FunctionCall {
                            id: Some(call.id),
                            name: call.function.name,
                            args: Some(args),
                        },
                        thought_signature,
                    });
                }
            }
        }

        if !parts.is_empty() {
            self.contents.push(Content::model(parts));
        }
    }

    fn push_tool_result(&mut self, tool_call_id: String, content: MessageContent) {
        let (text, images) = split_tool_content(content);
        let text = self.limiter.take(text);

        let mut parts = Vec::new();
        if self.degraded_ids.contains(&tool_call_id) {
            parts.push(Part::text(format!("[tool result] {text}")));
        } else {
            let name = self
                .tool_names
                .get(&tool_call_id)
                .cloned()
                .unwrap_or_else(|| tool_call_id.clone());
            parts.push(Part::FunctionResponse {
                function_response: FunctionResponse {
                    id: Some(tool_call_id),
                    name,
                    response: json!({ "output": text }),
                },
            });
        }
        // Images ride the same user turn as inlineData, never inside the
        // tool-output string.
        parts.extend(images);

        // Consecutive tool messages share one user turn.
        if let Some(last) = self.contents.last_mut()
            && last.role == Some(agpool_protocol::gemini::Role::User)
            && last
                .parts
                .iter()
                .any(|p| matches!(p, Part::FunctionResponse { .. }))
        {
            last.parts.extend(parts);
            return;
        }
        self.contents.push(Content::user(parts));
    }
}

fn build_system_instruction(texts: Vec<String>, opts: &TranslateOptions) -> Option<Content> {
    let mut all = Vec::new();
    if opts.official_system_prompt {
        all.push(OFFICIAL_PREAMBLE.to_string());
    }
    all.extend(texts);
    if all.is_empty() {
        None
    } else {
        Some(Content::system_text(all.join("\n")))
    }
}

fn content_to_text(content: MessageContent) -> Option<String> {
    match content {
        MessageContent::Text(text) => (!text.is_empty()).then_some(text),
        MessageContent::Parts(parts) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } if !text.is_empty() => Some(text),
                    _ => None,
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
    }
}

fn user_parts(content: MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Part::text(text)]
            }
        }
        MessageContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => (!text.is_empty()).then(|| Part::text(text)),
                ContentPart::ImageUrl { image_url } => parse_data_url(&image_url.url)
                    .map(|(mime, data)| Part::inline_data(mime, data)),
            })
            .collect(),
    }
}

/// Split a (possibly multimodal) tool message into joined text and image
/// parts.
fn split_tool_content(content: MessageContent) -> (String, Vec<Part>) {
    match content {
        MessageContent::Text(text) => (text, Vec::new()),
        MessageContent::Parts(parts) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => texts.push(text),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some((mime, data)) = parse_data_url(&image_url.url) {
                            images.push(Part::inline_data(mime, data));
                        }
                    }
                }
            }
            (texts.join("\n"), images)
        }
    }
}

pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn map_tools(tools: Option<Vec<ToolDefinition>>) -> Option<Vec<Tool>> {
    let tools = tools?;
    let declarations: Vec<FunctionDeclaration> = tools
        .into_iter()
        .map(|tool| {
            let ToolDefinition::Function { function } = tool;
            FunctionDeclaration {
                name: function.name,
                description: function.description.unwrap_or_default(),
                parameters: function.parameters,
            }
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
        ToolChoice::Mode(mode) => FunctionCallingConfig {
            mode: Some(match mode {
                ToolChoiceMode::None => FunctionCallingMode::None,
                ToolChoiceMode::Auto => FunctionCallingMode::Auto,
                ToolChoiceMode::Any | ToolChoiceMode::Required => FunctionCallingMode::Any,
            }),
            allowed_function_names: None,
        },
        ToolChoice::Named(named) => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![named.function.name]),
        },
    };
    Some(ToolConfig {
        function_calling_config: Some(config),
    })
}

fn map_response_format(
    format: Option<ResponseFormat>,
) -> (Option<JsonValue>, Option<String>) {
    match format {
        Some(ResponseFormat::JsonSchema { json_schema }) => {
            let schema = json_schema
                .schema
                .unwrap_or_else(|| json!({ "type": "object" }));
            (Some(schema), None)
        }
        Some(ResponseFormat::JsonObject) => (None, Some("application/json".to_string())),
        _ => (None, None),
    }
}
