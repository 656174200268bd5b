//! Upstream stream chunks → the Anthropic stream event taxonomy.
//!
//! Blocks never interleave: a block of one kind is stopped before a block of
//! another kind starts. Tool-use blocks open, carry one input_json_delta
//! (arguments arrive whole), and close immediately.

use agpool_common::models::ModelRoute;
use agpool_protocol::claude::{
    BlockDelta, ContentBlockOut, MessageDelta, MessagesResponse, StreamEvent, Usage,
};
use agpool_protocol::gemini::{GenerateResponse, Part, UsageMetadata};

use crate::{ThoughtSignatures, finish};

use super::response::{message_id, usage_from_metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
}

pub struct StreamEncoder {
    model: String,
    request_id: String,
    started: bool,
    next_index: u32,
    current_index: u32,
    open: Option<OpenBlock>,
    captured_thought: Option<(String, String)>,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    finished: bool,
}

impl StreamEncoder {
    pub fn new(route: &ModelRoute, request_id: &str) -> Self {
        Self {
            model: route.exposed.clone(),
            request_id: request_id.to_string(),
            started: false,
            next_index: 0,
            current_index: 0,
            open: None,
            captured_thought: None,
            saw_tool_use: false,
            finish_reason: None,
            usage: None,
            finished: false,
        }
    }

    pub fn push(
        &mut self,
        resp: &GenerateResponse,
        signatures: &dyn ThoughtSignatures,
    ) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(meta) = resp.usage_metadata {
            self.usage = Some(meta);
        }

        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                message: MessagesResponse {
                    id: message_id(&self.request_id),
                    kind: "message",
                    role: "assistant",
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: self
                            .usage
                            .and_then(|u| u.prompt_token_count)
                            .unwrap_or(0),
                        output_tokens: 0,
                        cache_read_input_tokens: None,
                    },
                },
            });
            out.push(StreamEvent::Ping);
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
                    self.ensure_block(OpenBlock::Thinking, &mut out);
                    if !text.is_empty() {
                        out.push(StreamEvent::ContentBlockDelta {
                            index: self.current_index,
                            delta: BlockDelta::ThinkingDelta {
                                thinking: text.clone(),
                            },
                        });
                    }
                    if let Some(signature) = thought_signature {
                        self.captured_thought = Some((signature.clone(), text.clone()));
                        out.push(StreamEvent::ContentBlockDelta {
                            index: self.current_index,
                            delta: BlockDelta::SignatureDelta {
                                signature: signature.clone(),
                            },
                        });
                    }
                }
                Part::Thought { .. } => {}
                Part::Text { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    self.ensure_block(OpenBlock::Text, &mut out);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.current_index,
                        delta: BlockDelta::TextDelta { text: text.clone() },
                    });
                }
                Part::InlineData { inline_data } => {
                    self.ensure_block(OpenBlock::Text, &mut out);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.current_index,
                        delta: BlockDelta::TextDelta {
                            text: format!(
                                "![image](data:{};base64,{})",
                                inline_data.mime_type, inline_data.data
                            ),
                        },
                    });
                }
                Part::FunctionCall {
                    function_call,
                    thought_signature,
                } => {
                    self.close_block(&mut out);
                    let id = function_call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                    if let Some(signature) = thought_signature {
                        signatures.remember_tool_signature(&id, signature);
                    }
                    if !self.saw_tool_use
                        && let Some((signature, text)) = &self.captured_thought
                    {
                        signatures.remember_claude_thinking(&id, signature, text);
                    }
                    self.saw_tool_use = true;

                    let index = self.next_index;
                    self.next_index += 1;
                    out.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlockOut::ToolUse {
                            id,
                            name: function_call.name.clone(),
                            input: serde_json::Value::Object(Default::default()),
                        },
                    });
                    out.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: function_call
                                .args
                                .as_ref()
                                .map(|args| args.to_string())
                                .unwrap_or_else(|| "{}".to_string()),
                        },
                    });
                    out.push(StreamEvent::ContentBlockStop { index });
                }
                Part::FunctionResponse { .. } => {}
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        if !self.started {
            // Empty upstream stream: still produce a well-formed message.
            self.started = true;
            out.push(StreamEvent::MessageStart {
                message: MessagesResponse {
                    id: message_id(&self.request_id),
                    kind: "message",
                    role: "assistant",
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage::default(),
                },
            });
        }
        self.close_block(&mut out);

        let stop_reason = finish::to_claude(self.finish_reason.as_deref(), self.saw_tool_use);
        out.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self
                .usage
                .as_ref()
                .map(usage_from_metadata)
                .unwrap_or_default(),
        });
        out.push(StreamEvent::MessageStop);
        out
    }

    fn ensure_block(&mut self, kind: OpenBlock, out: &mut Vec<StreamEvent>) {
        if self.open == Some(kind) {
            return;
        }
        self.close_block(out);
        let index = self.next_index;
        self.next_index += 1;
        self.current_index = index;
        self.open = Some(kind);
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: match kind {
                OpenBlock::Text => ContentBlockOut::Text {
                    text: String::new(),
                },
                OpenBlock::Thinking => ContentBlockOut::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            },
        });
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            out.push(StreamEvent::ContentBlockStop {
                index: self.current_index,
            });
        }
    }

}
