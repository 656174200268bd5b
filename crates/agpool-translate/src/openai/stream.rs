//! Upstream stream chunks → OpenAI chat-completion chunks.
//!
//! One delta per emitted chunk: content, reasoning, or a single tool-call
//! delta with a monotonic index. A `</think>` always closes before any
//! content or tool_call delta that follows a thought chunk.

use agpool_common::ThinkingOutput;
use agpool_common::models::ModelRoute;
use agpool_protocol::gemini::{GenerateResponse, Part, UsageMetadata};
use agpool_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, Delta, FunctionCallDelta, ToolCallDelta, ToolCallKind,
};

use crate::{ThoughtSignatures, TranslateOptions, finish};

use super::response::usage_from_metadata;

pub struct StreamEncoder {
    id: String,
    model: String,
    created: i64,
    thinking_output: ThinkingOutput,
    include_usage: bool,
    is_claude: bool,

    sent_role: bool,
    think_open: bool,
    next_tool_index: u32,
    saw_tool_calls: bool,
    captured_thought: Option<(String, String)>,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    finished: bool,
}

impl StreamEncoder {
    pub fn new(
        route: &ModelRoute,
        request_id: &str,
        created: i64,
        opts: &TranslateOptions,
        include_usage: bool,
    ) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: route.exposed.clone(),
            created,
            thinking_output: opts.thinking_output,
            include_usage,
            is_claude: route.is_claude(),
            sent_role: false,
            think_open: false,
            next_tool_index: 0,
            saw_tool_calls: false,
            captured_thought: None,
            finish_reason: None,
            usage: None,
            finished: false,
        }
    }

    pub fn push(
        &mut self,
        resp: &GenerateResponse,
        signatures: &dyn ThoughtSignatures,
    ) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        if let Some(meta) = resp.usage_metadata {
            self.usage = Some(meta);
        }

        let Some(candidate) = resp.candidates.first() else {
            return out;
        };
        if let Some(reason) = &candidate.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
        let Some(content) = &candidate.content else {
            return out;
        };

        for part in &content.parts {
            match part {
                Part::Thought {
                    thought: true,
                    text,
                    thought_signature,
                } => {
                    if let Some(signature) = thought_signature {
                        self.captured_thought = Some((signature.clone(), text.clone()));
                    }
                    if text.is_empty() {
                        continue;
                    }
                    if self.thinking_output.wants_reasoning_field() {
                        out.push(self.chunk(Delta {
                            reasoning_content: Some(text.clone()),
                            ..Default::default()
                        }));
                    }
                    if self.thinking_output.wants_tags() {
                        let rendered = if self.think_open {
                            text.clone()
                        } else {
                            self.think_open = true;
                            format!("<think>{text}")
                        };
                        out.push(self.chunk(Delta {
                            content: Some(rendered),
                            ..Default::default()
                        }));
                    }
                }
                Part::Thought { .. } => {}
                Part::Text { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    let text = self.close_think(text.clone());
                    out.push(self.chunk(Delta {
                        content: Some(text),
                        ..Default::default()
                    }));
                }
                Part::InlineData { inline_data } => {
                    let markdown = format!(
                        "![image](data:{};base64,{})",
                        inline_data.mime_type, inline_data.data
                    );
                    let markdown = self.close_think(markdown);
                    out.push(self.chunk(Delta {
                        content: Some(markdown),
                        ..Default::default()
                    }));
                }
                Part::FunctionCall {
                    function_call,
                    thought_signature,
                } => {
                    if self.think_open {
                        let closer = self.close_think(String::new());
                        out.push(self.chunk(Delta {
                            content: Some(closer),
                            ..Default::default()
                        }));
                    }
                    let id = function_call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    if let Some(signature) = thought_signature {
                        signatures.remember_tool_signature(&id, signature);
                    }
                    if self.is_claude
                        && !self.saw_tool_calls
                        && let Some((signature, text)) = &self.captured_thought
                    {
                        signatures.remember_claude_thinking(&id, signature, text);
                    }
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.saw_tool_calls = true;
                    out.push(self.chunk(Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: Some(id),
                            kind: Some(ToolCallKind::Function),
                            function: FunctionCallDelta {
                                name: Some(function_call.name.clone()),
                                arguments: Some(
                                    function_call
                                        .args
                                        .as_ref()
                                        .map(|args| args.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                ),
                            },
                        }]),
                        ..Default::default()
                    }));
                }
                Part::FunctionResponse { .. } => {}
            }
        }
        out
    }

    /// Terminal chunks: the finish_reason frame, and the usage frame when
    /// the client opted in. The caller appends `data: [DONE]`.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();

        if self.think_open {
            let closer = self.close_think(String::new());
            out.push(self.chunk(Delta {
                content: Some(closer),
                ..Default::default()
            }));
        }

        let finish_reason =
            finish::to_openai(self.finish_reason.as_deref(), self.saw_tool_calls);
        let mut terminal = self.base_chunk();
        terminal.choices.push(ChunkChoice {
            index: 0,
            delta: Delta::default(),
            finish_reason: Some(finish_reason),
        });
        out.push(terminal);

        if self.include_usage {
            let mut usage_chunk = self.base_chunk();
            usage_chunk.usage = Some(
                self.usage
                    .as_ref()
                    .map(usage_from_metadata)
                    .unwrap_or_default(),
            );
            out.push(usage_chunk);
        }
        out
    }

    fn close_think(&mut self, text: String) -> String {
        if self.think_open {
            self.think_open = false;
            format!("</think>{text}")
        } else {
            text
        }
    }

    fn chunk(&mut self, mut delta: Delta) -> ChatCompletionChunk {
        if !self.sent_role {
            self.sent_role = true;
            delta.role = Some("assistant");
        }
        let mut chunk = self.base_chunk();
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: None,
        });
        chunk
    }

    fn base_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: None,
        }
    }
}
