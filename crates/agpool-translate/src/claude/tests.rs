use std::collections::HashMap;
use std::sync::Mutex;

use agpool_common::models::resolve_model;
use agpool_protocol::claude::{MessagesRequest, StreamEvent};
use agpool_protocol::gemini::{Candidate, Content, FunctionCall, GenerateResponse, Part};

use crate::{NoSignatures, ThoughtSignatures, TranslateOptions};

use super::{StreamEncoder, build_upstream, encode_response};

#[derive(Default)]
struct MapSignatures {
    claude: Mutex<HashMap<String, (String, String)>>,
}

impl ThoughtSignatures for MapSignatures {
    fn tool_signature(&self, _id: &str) -> Option<String> {
        None
    }

    fn claude_thinking(&self, id: &str) -> Option<(String, String)> {
        self.claude.lock().unwrap().get(id).cloned()
    }

    fn remember_tool_signature(&self, _id: &str, _signature: &str) {}

    fn remember_claude_thinking(&self, id: &str, signature: &str, text: &str) {
        self.claude
            .lock()
            .unwrap()
            .insert(id.to_string(), (signature.to_string(), text.to_string()));
    }
}

fn parse(raw: &str) -> MessagesRequest {
    serde_json::from_str(raw).unwrap()
}

#[test]
fn second_turn_replays_cached_thinking_block() {
    let signatures = MapSignatures::default();
    signatures.remember_claude_thinking("toolu_1", "sig-from-turn-one", "let me search");

    let raw = r#"{
        "model": "claude-sonnet-4-6-thinking",
        "max_tokens": 4096,
        "messages": [
            {"role": "user", "content": "search X"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "X"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "result"}
            ]}
        ]
    }"#;
    let route = resolve_model("claude-sonnet-4-6-thinking");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &signatures,
        1,
    )
    .unwrap();

    assert!(!built.thinking_downgraded);
    let assistant = &built.envelope.request.contents[1];
    let Part::Thought {
        text,
        thought_signature,
        ..
    } = &assistant.parts[0]
    else {
        panic!("expected replayed thought first");
    };
    assert_eq!(text, "let me search");
    assert_eq!(thought_signature.as_deref(), Some("sig-from-turn-one"));
    assert!(matches!(assistant.parts[1], Part::FunctionCall { .. }));
}

#[test]
fn cache_miss_downgrades_and_empty_thought_gets_space() {
    let raw = r#"{
        "model": "claude-sonnet-4-6-thinking",
        "max_tokens": 4096,
        "messages": [
            {"role": "user", "content": "go"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "t", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok"}
            ]}
        ]
    }"#;
    let route = resolve_model("claude-sonnet-4-6-thinking");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();
    assert!(built.thinking_downgraded);
    assert!(
        built
            .envelope
            .request
            .generation_config
            .as_ref()
            .unwrap()
            .thinking_config
            .is_none()
    );

    // Empty cached thought text falls back to a single space.
    let signatures = MapSignatures::default();
    signatures.remember_claude_thinking("toolu_1", "sig", "");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &signatures,
        1,
    )
    .unwrap();
    let Part::Thought { text, .. } = &built.envelope.request.contents[1].parts[0] else {
        panic!("expected thought");
    };
    assert_eq!(text, " ");
}

#[test]
fn prefill_moves_into_system_hint_when_thinking() {
    let raw = r#"{
        "model": "claude-sonnet-4-6",
        "max_tokens": 2048,
        "thinking": {"type": "enabled", "budget_tokens": 1024},
        "messages": [
            {"role": "user", "content": "give me json"},
            {"role": "assistant", "content": "{"}
        ]
    }"#;
    let route = resolve_model("claude-sonnet-4-6");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();

    // The prefill message is gone.
    assert_eq!(built.envelope.request.contents.len(), 1);
    let system = built.envelope.request.system_instruction.as_ref().unwrap();
    let hint = system.parts[0].as_text().unwrap();
    assert!(hint.contains("start your response with '{'"));

    // Text prefill keeps the exact-prefix wording.
    let raw = r#"{
        "model": "claude-sonnet-4-6",
        "max_tokens": 2048,
        "thinking": {"type": "enabled", "budget_tokens": 1024},
        "messages": [
            {"role": "user", "content": "greet me"},
            {"role": "assistant", "content": "Sure, here"}
        ]
    }"#;
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();
    let system = built.envelope.request.system_instruction.as_ref().unwrap();
    assert!(
        system.parts[0]
            .as_text()
            .unwrap()
            .contains("following prefix exactly: Sure, here")
    );
}

#[test]
fn thinking_budget_clamps_against_max_tokens() {
    let raw = r#"{
        "model": "claude-sonnet-4-6",
        "max_tokens": 2048,
        "thinking": {"type": "enabled", "budget_tokens": 4096},
        "messages": [{"role": "user", "content": "hi"}]
    }"#;
    let route = resolve_model("claude-sonnet-4-6");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();
    let config = built.envelope.request.generation_config.as_ref().unwrap();
    let thinking = config.thinking_config.unwrap();
    assert_eq!(thinking.thinking_budget, Some(4096));
    assert!(config.max_output_tokens.unwrap() > 4096);
}

#[test]
fn tool_result_error_flag_prefixes_output() {
    let raw = r#"{
        "model": "claude-sonnet-4-6",
        "max_tokens": 1024,
        "messages": [
            {"role": "user", "content": "go"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "run", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "exit 1", "is_error": true}
            ]}
        ]
    }"#;
    let route = resolve_model("claude-sonnet-4-6");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();
    let tool_turn = built.envelope.request.contents.last().unwrap();
    let Part::FunctionResponse { function_response } = &tool_turn.parts[0] else {
        panic!("expected functionResponse");
    };
    assert_eq!(function_response.name, "run");
    assert!(
        function_response.response["output"]
            .as_str()
            .unwrap()
            .starts_with("Error:")
    );
}

fn model_chunk(parts: Vec<Part>, finish: Option<&str>) -> GenerateResponse {
    GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(parts)),
            finish_reason: finish.map(|f| f.to_string()),
            index: Some(0),
        }],
        ..Default::default()
    }
}

#[test]
fn stream_emits_full_taxonomy_without_interleaving() {
    let route = resolve_model("claude-sonnet-4-6-thinking");
    let mut encoder = StreamEncoder::new(&route, "agent/1/u/0");

    let mut events = Vec::new();
    events.extend(encoder.push(
        &model_chunk(vec![Part::thought("hmm", Some("sig-9".into()))], None),
        &NoSignatures,
    ));
    events.extend(encoder.push(
        &model_chunk(
            vec![Part::FunctionCall {
                function_call: FunctionCall {
                    id: Some("toolu_1".into()),
                    name: "search".into(),
                    args: Some(serde_json::json!({"q": "x"})),
                },
                thought_signature: None,
            }],
            Some("STOP"),
        ),
        &NoSignatures,
    ));
    events.extend(encoder.finish());

    let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start", // thinking (index 0)
            "content_block_delta", // thinking_delta
            "content_block_delta", // signature_delta
            "content_block_stop",
            "content_block_start", // tool_use (index 1)
            "content_block_delta", // input_json_delta
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    // Tool block got a fresh index.
    let StreamEvent::ContentBlockStart { index, .. } = &events[6] else {
        panic!("expected block start");
    };
    assert_eq!(*index, 1);

    let StreamEvent::MessageDelta { delta, .. } = &events[9] else {
        panic!("expected message_delta");
    };
    assert_eq!(
        delta.stop_reason,
        Some(agpool_protocol::claude::StopReason::ToolUse)
    );
}

#[test]
fn stream_caches_thinking_for_the_first_tool_use() {
    let route = resolve_model("claude-sonnet-4-6-thinking");
    let signatures = MapSignatures::default();
    let mut encoder = StreamEncoder::new(&route, "agent/1/u/0");

    encoder.push(
        &model_chunk(vec![Part::thought("deep", Some("sig-1".into()))], None),
        &signatures,
    );
    encoder.push(
        &model_chunk(
            vec![Part::FunctionCall {
                function_call: FunctionCall {
                    id: Some("toolu_7".into()),
                    name: "t".into(),
                    args: None,
                },
                thought_signature: None,
            }],
            None,
        ),
        &signatures,
    );

    assert_eq!(
        signatures.claude_thinking("toolu_7"),
        Some(("sig-1".to_string(), "deep".to_string()))
    );
}

#[test]
fn unary_response_maps_blocks_and_stop_reason() {
    let route = resolve_model("claude-sonnet-4-6");
    let resp = GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![
                Part::thought("planning", Some("sig".into())),
                Part::text("All done."),
            ])),
            finish_reason: Some("STOP".into()),
            index: Some(0),
        }],
        usage_metadata: Some(agpool_protocol::gemini::UsageMetadata {
            prompt_token_count: Some(10),
            candidates_token_count: Some(4),
            thoughts_token_count: Some(6),
            ..Default::default()
        }),
        ..Default::default()
    };
    let message = encode_response(&resp, &route, "agent/1/abc-def/0", &NoSignatures);
    assert!(message.id.starts_with("msg_"));
    assert_eq!(message.content.len(), 2);
    assert_eq!(
        message.stop_reason,
        Some(agpool_protocol::claude::StopReason::EndTurn)
    );
    assert_eq!(message.usage.input_tokens, 10);
    assert_eq!(message.usage.output_tokens, 10);
}
