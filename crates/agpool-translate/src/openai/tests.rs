use std::collections::HashMap;
use std::sync::Mutex;

use agpool_common::models::resolve_model;
use agpool_protocol::gemini::{Candidate, Content, FunctionCall, GenerateResponse, Part, Role};
use agpool_protocol::openai::ChatCompletionRequest;

use crate::{NoSignatures, SENTINEL_SIGNATURE, ThoughtSignatures, TranslateOptions};

use super::{StreamEncoder, build_upstream, encode_response};

#[derive(Default)]
struct MapSignatures {
    tool: Mutex<HashMap<String, String>>,
    claude: Mutex<HashMap<String, (String, String)>>,
}

impl ThoughtSignatures for MapSignatures {
    fn tool_signature(&self, id: &str) -> Option<String> {
        self.tool.lock().unwrap().get(id).cloned()
    }

    fn claude_thinking(&self, id: &str) -> Option<(String, String)> {
        self.claude.lock().unwrap().get(id).cloned()
    }

    fn remember_tool_signature(&self, id: &str, signature: &str) {
        self.tool
            .lock()
            .unwrap()
            .insert(id.to_string(), signature.to_string());
    }

    fn remember_claude_thinking(&self, id: &str, signature: &str, text: &str) {
        self.claude
            .lock()
            .unwrap()
            .insert(id.to_string(), (signature.to_string(), text.to_string()));
    }
}

fn parse(raw: &str) -> ChatCompletionRequest {
    serde_json::from_str(raw).unwrap()
}

#[test]
fn minimal_request_gets_defaults() {
    let req = parse(r#"{"model":"gemini-2.5-flash","messages":[{"role":"user","content":"hello"}]}"#);
    let route = resolve_model("gemini-2.5-flash");
    let built = build_upstream(req, &route, &TranslateOptions::default(), &NoSignatures, 1).unwrap();

    let request = &built.envelope.request;
    assert_eq!(request.contents.len(), 1);
    assert_eq!(request.contents[0].role, Some(Role::User));
    assert_eq!(request.contents[0].parts[0].as_text(), Some("hello"));
    let config = request.generation_config.as_ref().unwrap();
    assert_eq!(config.temperature, Some(1.0));
    assert_eq!(config.max_output_tokens, Some(8192));
    assert!(config.thinking_config.is_none());
    assert_eq!(request.safety_settings.as_ref().unwrap().len(), 11);
    assert!(built.envelope.request_id.starts_with("agent/1/"));
}

#[test]
fn tool_result_with_images_splits_text_and_inline_data() {
    let png = "iVBORw0KGgoAAAANSUhEUg==";
    let raw = format!(
        r#"{{"model":"gemini-2.5-flash","messages":[
            {{"role":"user","content":"go"}},
            {{"role":"assistant","tool_calls":[{{"id":"call_1","type":"function","function":{{"name":"shot","arguments":"{{}}"}}}}]}},
            {{"role":"tool","tool_call_id":"call_1","content":[
                {{"type":"text","text":"first"}},
                {{"type":"image_url","image_url":{{"url":"data:image/png;base64,{png}"}}}},
                {{"type":"text","text":"second"}}
            ]}}
        ]}}"#
    );
    let route = resolve_model("gemini-2.5-flash");
    let built = build_upstream(
        parse(&raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();

    let turn = built.envelope.request.contents.last().unwrap();
    assert_eq!(turn.role, Some(Role::User));
    let responses: Vec<_> = turn
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::FunctionResponse { function_response } => Some(function_response),
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 1);
    let output = responses[0].response["output"].as_str().unwrap();
    assert_eq!(output, "first\nsecond");
    assert!(!output.contains(png));
    let images = turn
        .parts
        .iter()
        .filter(|p| matches!(p, Part::InlineData { .. }))
        .count();
    assert_eq!(images, 1);
}

#[test]
fn consecutive_tool_messages_merge_into_one_turn() {
    let raw = r#"{"model":"gemini-2.5-flash","messages":[
        {"role":"user","content":"go"},
        {"role":"assistant","tool_calls":[
            {"id":"call_1","type":"function","function":{"name":"a","arguments":"{}"}},
            {"id":"call_2","type":"function","function":{"name":"b","arguments":"{}"}}
        ]},
        {"role":"tool","tool_call_id":"call_1","content":"one"},
        {"role":"tool","tool_call_id":"call_2","content":"two"}
    ]}"#;
    let route = resolve_model("gemini-2.5-flash");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();

    // user, assistant, merged tool turn.
    assert_eq!(built.envelope.request.contents.len(), 3);
    let tool_turn = &built.envelope.request.contents[2];
    let responses = tool_turn
        .parts
        .iter()
        .filter(|p| matches!(p, Part::FunctionResponse { .. }))
        .count();
    assert_eq!(responses, 2);
}

#[test]
fn gemini_replay_uses_cached_or_sentinel_signature() {
    let signatures = MapSignatures::default();
    signatures.remember_tool_signature("call_1", "real-sig");

    let raw = r#"{"model":"gemini-2.5-flash","messages":[
        {"role":"user","content":"go"},
        {"role":"assistant","tool_calls":[
            {"id":"call_1","type":"function","function":{"name":"a","arguments":"{}"}},
            {"id":"call_2","type":"function","function":{"name":"b","arguments":"{}"}}
        ]},
        {"role":"tool","tool_call_id":"call_1","content":"one"},
        {"role":"tool","tool_call_id":"call_2","content":"two"}
    ]}"#;
    let route = resolve_model("gemini-2.5-flash");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &signatures,
        1,
    )
    .unwrap();

    let sigs: Vec<Option<&str>> = built.envelope.request.contents[1]
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::FunctionCall {
                thought_signature, ..
            } => Some(thought_signature.as_deref()),
            _ => None,
        })
        .collect();
    assert_eq!(sigs, vec![Some("real-sig"), Some(SENTINEL_SIGNATURE)]);
}

#[test]
fn claude_replay_inserts_cached_thought_before_tool_call() {
    let signatures = MapSignatures::default();
    signatures.remember_claude_thinking("toolu_1", "sig-abc", "let me think");

    let raw = r#"{"model":"claude-sonnet-4-6-thinking","messages":[
        {"role":"user","content":"search X"},
        {"role":"assistant","tool_calls":[
            {"id":"toolu_1","type":"function","function":{"name":"search","arguments":"{\"q\":\"X\"}"}}
        ]},
        {"role":"tool","tool_call_id":"toolu_1","content":"result"}
    ]}"#;
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
        thought_signature, ..
    } = &assistant.parts[0]
    else {
        panic!("expected thought part first, got {:?}", assistant.parts[0]);
    };
    assert_eq!(thought_signature.as_deref(), Some("sig-abc"));
    assert!(matches!(assistant.parts[1], Part::FunctionCall { .. }));
    // Thinking stays enabled.
    let config = built.envelope.request.generation_config.as_ref().unwrap();
    assert!(config.thinking_config.is_some());
}

#[test]
fn claude_replay_cache_miss_downgrades_thinking() {
    let raw = r#"{"model":"claude-sonnet-4-6-thinking","messages":[
        {"role":"user","content":"search X"},
        {"role":"assistant","tool_calls":[
            {"id":"toolu_1","type":"function","function":{"name":"search","arguments":"{}"}}
        ]},
        {"role":"tool","tool_call_id":"toolu_1","content":"result"}
    ]}"#;
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
    let config = built.envelope.request.generation_config.as_ref().unwrap();
    assert!(config.thinking_config.is_none());
}

#[test]
fn foreign_family_tool_history_degrades_to_text() {
    // toolu_* ids on a Gemini-family target.
    let raw = r#"{"model":"gemini-2.5-flash","messages":[
        {"role":"user","content":"go"},
        {"role":"assistant","tool_calls":[
            {"id":"toolu_9","type":"function","function":{"name":"search","arguments":"{}"}}
        ]},
        {"role":"tool","tool_call_id":"toolu_9","content":"result"}
    ]}"#;
    let route = resolve_model("gemini-2.5-flash");
    let built = build_upstream(
        parse(raw),
        &route,
        &TranslateOptions::default(),
        &NoSignatures,
        1,
    )
    .unwrap();

    for content in &built.envelope.request.contents {
        for part in &content.parts {
            assert!(
                !matches!(part, Part::FunctionCall { .. } | Part::FunctionResponse { .. }),
                "degraded history must be plain text"
            );
        }
    }
}

fn text_chunk(text: &str) -> GenerateResponse {
    GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![Part::text(text)])),
            finish_reason: None,
            index: Some(0),
        }],
        ..Default::default()
    }
}

fn thought_chunk(text: &str, signature: Option<&str>) -> GenerateResponse {
    GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![Part::thought(
                text,
                signature.map(|s| s.to_string()),
            )])),
            finish_reason: None,
            index: Some(0),
        }],
        ..Default::default()
    }
}

#[test]
fn stream_reasoning_then_content_then_stop() {
    let route = resolve_model("gemini-2.5-pro");
    let opts = TranslateOptions::default();
    let mut encoder = StreamEncoder::new(&route, "agent/1/u/0", 1, &opts, false);

    let chunks = encoder.push(&thought_chunk("pondering", None), &NoSignatures);
    assert_eq!(chunks.len(), 1);
    assert_eq!(
        chunks[0].choices[0].delta.reasoning_content.as_deref(),
        Some("pondering")
    );
    assert_eq!(chunks[0].choices[0].delta.role, Some("assistant"));

    let chunks = encoder.push(&text_chunk("answer"), &NoSignatures);
    assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("answer"));

    let mut stop = text_chunk("");
    stop.candidates[0].content = None;
    stop.candidates[0].finish_reason = Some("STOP".to_string());
    assert!(encoder.push(&stop, &NoSignatures).is_empty());

    let terminal = encoder.finish();
    assert_eq!(
        terminal.last().unwrap().choices[0].finish_reason.as_deref(),
        Some("stop")
    );
}

#[test]
fn stream_tags_mode_closes_think_before_content() {
    let route = resolve_model("gemini-2.5-pro");
    let opts = TranslateOptions {
        thinking_output: agpool_common::ThinkingOutput::Tags,
        ..Default::default()
    };
    let mut encoder = StreamEncoder::new(&route, "agent/1/u/0", 1, &opts, false);

    let chunks = encoder.push(&thought_chunk("hmm", None), &NoSignatures);
    assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("<think>hmm"));

    let chunks = encoder.push(&text_chunk("out"), &NoSignatures);
    assert_eq!(
        chunks[0].choices[0].delta.content.as_deref(),
        Some("</think>out")
    );
}

#[test]
fn stream_tool_call_indices_are_monotonic() {
    let route = resolve_model("gemini-2.5-flash");
    let opts = TranslateOptions::default();
    let mut encoder = StreamEncoder::new(&route, "agent/1/u/0", 1, &opts, false);

    let resp = GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![
                Part::FunctionCall {
                    function_call: FunctionCall {
                        id: Some("call_a".into()),
                        name: "a".into(),
                        args: Some(serde_json::json!({})),
                    },
                    thought_signature: None,
                },
                Part::FunctionCall {
                    function_call: FunctionCall {
                        id: Some("call_b".into()),
                        name: "b".into(),
                        args: Some(serde_json::json!({})),
                    },
                    thought_signature: None,
                },
            ])),
            finish_reason: Some("STOP".into()),
            index: Some(0),
        }],
        ..Default::default()
    };
    let chunks = encoder.push(&resp, &NoSignatures);
    let indices: Vec<u32> = chunks
        .iter()
        .filter_map(|c| c.choices[0].delta.tool_calls.as_ref())
        .map(|t| t[0].index)
        .collect();
    assert_eq!(indices, vec![0, 1]);

    let terminal = encoder.finish();
    assert_eq!(
        terminal.last().unwrap().choices[0].finish_reason.as_deref(),
        Some("tool_calls")
    );
}

#[test]
fn stream_captures_claude_thinking_for_next_turn() {
    let route = resolve_model("claude-sonnet-4-6-thinking");
    let opts = TranslateOptions::default();
    let signatures = MapSignatures::default();
    let mut encoder = StreamEncoder::new(&route, "agent/1/u/0", 1, &opts, false);

    encoder.push(&thought_chunk("deep thought", Some("sig-1")), &signatures);
    let resp = GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![Part::FunctionCall {
                function_call: FunctionCall {
                    id: Some("toolu_1".into()),
                    name: "search".into(),
                    args: Some(serde_json::json!({"q":"x"})),
                },
                thought_signature: None,
            }])),
            finish_reason: None,
            index: Some(0),
        }],
        ..Default::default()
    };
    encoder.push(&resp, &signatures);

    assert_eq!(
        signatures.claude_thinking("toolu_1"),
        Some(("sig-1".to_string(), "deep thought".to_string()))
    );
}

#[test]
fn unary_response_encodes_message_and_usage() {
    let route = resolve_model("gemini-2.5-flash");
    let resp = GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![Part::text("hello back")])),
            finish_reason: Some("STOP".into()),
            index: Some(0),
        }],
        usage_metadata: Some(agpool_protocol::gemini::UsageMetadata {
            prompt_token_count: Some(3),
            candidates_token_count: Some(5),
            total_token_count: Some(8),
            ..Default::default()
        }),
        ..Default::default()
    };
    let completion = encode_response(
        &resp,
        &route,
        "agent/1/u/0",
        99,
        &TranslateOptions::default(),
        &NoSignatures,
    );
    assert_eq!(completion.id, "chatcmpl-agent/1/u/0");
    assert_eq!(completion.object, "chat.completion");
    assert_eq!(
        completion.choices[0].message.content.as_deref(),
        Some("hello back")
    );
    assert_eq!(completion.choices[0].finish_reason, "stop");
    let usage = completion.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 3);
    assert_eq!(usage.completion_tokens, 5);
    assert_eq!(usage.total_tokens, 8);
}
