//! Property-based tests for the relay.
//!
//! These tests use proptest to verify properties that should hold for all
//! inputs, focusing on tool-name shortening and content-block sequencing.

use llm_relay_rust::transformer::stream::BlockState;
use llm_relay_rust::transformer::tool_names::TOOL_NAME_LIMIT;
use llm_relay_rust::transformer::{
    ChunkType, Protocol, ResponseContext, StreamDelta, StreamState, ToolNameMap,
    TranslatorRegistry,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashSet;

/// Tool names from short to far over the limit, MCP-style and plain.
fn tool_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z_]{1,40}",
        "[a-z_]{60,120}",
        ("[a-z]{3,20}", "[a-z_]{40,90}").prop_map(|(server, tool)| format!("mcp__{}__{}", server, tool)),
    ]
}

#[derive(Debug, Clone)]
enum Step {
    Text(String),
    Thinking(String),
    ToolCall(String),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        "[a-z ]{1,10}".prop_map(Step::Text),
        "[a-z ]{1,10}".prop_map(Step::Thinking),
        "[a-z_]{1,10}".prop_map(Step::ToolCall),
    ]
}

proptest! {
    #[test]
    fn prop_shortened_names_fit_and_restore(names in prop::collection::vec(tool_name_strategy(), 1..12)) {
        let map = ToolNameMap::build(names.iter().map(String::as_str), TOOL_NAME_LIMIT);

        let mut shortened = HashSet::new();
        for name in &names {
            let short = map.shorten(name);
            prop_assert!(short.chars().count() <= TOOL_NAME_LIMIT);
            prop_assert_eq!(map.restore(short), name.as_str());
            shortened.insert(short.to_string());
        }
        let distinct: HashSet<&String> = names.iter().collect();
        prop_assert_eq!(shortened.len(), distinct.len());
    }

    #[test]
    fn prop_short_names_never_change(names in prop::collection::vec("[a-z_]{1,64}", 1..8)) {
        let map = ToolNameMap::build(names.iter().map(String::as_str), TOOL_NAME_LIMIT);
        prop_assert!(map.is_empty());
        for name in &names {
            prop_assert_eq!(map.shorten(name), name.as_str());
        }
    }

    #[test]
    fn prop_block_indices_are_sequential(steps in prop::collection::vec(step_strategy(), 0..20)) {
        let mut state = StreamState::new("m");
        let mut chunks = state.apply(StreamDelta::MessageStart { id: None, model: None, usage: None });
        for (n, step) in steps.iter().enumerate() {
            let delta = match step {
                Step::Text(t) => StreamDelta::Text(t.clone()),
                Step::Thinking(t) => StreamDelta::Thinking(t.clone()),
                Step::ToolCall(name) => StreamDelta::ToolCall {
                    id: format!("call_{}", n),
                    name: name.clone(),
                    arguments: "{}".into(),
                },
            };
            chunks.extend(state.apply(delta));
        }
        chunks.extend(state.finish());

        let mut open: Option<usize> = None;
        let mut next_index = 0;
        for chunk in &chunks {
            match chunk.chunk_type {
                ChunkType::ContentBlockStart => {
                    prop_assert!(open.is_none(), "block opened while another is open");
                    prop_assert_eq!(chunk.index, next_index);
                    open = Some(chunk.index);
                    next_index += 1;
                }
                ChunkType::ContentBlockDelta => prop_assert_eq!(Some(chunk.index), open),
                ChunkType::ContentBlockStop => {
                    prop_assert_eq!(Some(chunk.index), open);
                    open = None;
                }
                _ => {}
            }
        }
        prop_assert!(open.is_none());
        prop_assert_eq!(state.block(), &BlockState::Idle);
        prop_assert!(state.is_finished());

        let starts = chunks.iter().filter(|c| c.chunk_type == ChunkType::MessageStart).count();
        let stops = chunks.iter().filter(|c| c.chunk_type == ChunkType::MessageStop).count();
        prop_assert_eq!((starts, stops), (1, 1));
    }
}

#[test]
fn test_text_tool_text_uses_three_blocks() {
    let mut state = StreamState::new("m");
    let mut chunks = state.apply(StreamDelta::Text("a".into()));
    chunks.extend(state.apply(StreamDelta::ToolCall {
        id: "call_1".into(),
        name: "lookup".into(),
        arguments: r#"{"q":1}"#.into(),
    }));
    chunks.extend(state.apply(StreamDelta::Text("b".into())));
    chunks.extend(state.finish());

    let starts: Vec<usize> = chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::ContentBlockStart)
        .map(|c| c.index)
        .collect();
    assert_eq!(starts, vec![0, 1, 2]);
}

#[test]
fn test_five_long_tool_names_survive_codex_round_trip() {
    let registry = TranslatorRegistry::with_defaults();
    let names: Vec<String> = (0..5)
        .map(|i| format!("mcp__workspace_server_{}__{}", i, "very_long_tool_name_".repeat(4)))
        .collect();
    let tools: Vec<Value> = names
        .iter()
        .map(|n| json!({"type": "function", "function": {"name": n, "parameters": {"type": "object"}}}))
        .collect();
    let original = json!({
        "model": "gpt-5-codex",
        "messages": [{"role": "user", "content": "go"}],
        "tools": tools
    });

    let translated = registry
        .request(Protocol::OpenAI, Protocol::Codex, "gpt-5-codex", original.clone(), false)
        .unwrap();
    let short: Vec<String> = translated["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(short.len(), 5);
    assert!(short.iter().all(|s| s.chars().count() <= TOOL_NAME_LIMIT));
    assert_eq!(short.iter().collect::<HashSet<_>>().len(), 5);

    let output: Vec<Value> = short
        .iter()
        .enumerate()
        .map(|(i, s)| json!({"type": "function_call", "call_id": format!("c{}", i), "name": s, "arguments": "{}"}))
        .collect();
    let backend = json!({"id": "resp_1", "status": "completed", "output": output});
    let ctx = ResponseContext::new("gpt-5-codex", original, translated);
    let out = registry
        .response_non_stream(Protocol::OpenAI, Protocol::Codex, &ctx, backend.to_string().as_bytes())
        .unwrap();

    let restored: Vec<&str> = out["choices"][0]["message"]["tool_calls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["function"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(restored, names.iter().map(String::as_str).collect::<Vec<_>>());
}
